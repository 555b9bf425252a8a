//! Weather snapshot data carried into the report.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current conditions as returned by the weather service, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub fields: BTreeMap<String, Value>,
    /// Multi-day forecast, when the service provided one.
    #[serde(default)]
    pub forecast: Option<Forecast>,
}

impl WeatherSnapshot {
    /// Build a snapshot from a service response body.
    ///
    /// A top-level `data` object is unwrapped. Anything other than a JSON
    /// object is rejected.
    pub fn from_payload(payload: Value) -> Result<Self, String> {
        let body = match payload {
            Value::Object(mut map) if matches!(map.get("data"), Some(Value::Object(_))) => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };
        match body {
            Value::Object(map) => Ok(Self {
                fetched_at: Utc::now(),
                fields: map.into_iter().collect(),
                forecast: None,
            }),
            other => Err(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )),
        }
    }

    /// Display form of a field: strings as-is, everything else as compact JSON.
    pub fn display_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Forecast points as returned by the service, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub items: Vec<Value>,
}

/// Mean forecast value for one calendar day.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastDay {
    pub date: NaiveDate,
    pub avg_value: f64,
    pub points: usize,
}

impl Forecast {
    /// Accepts a bare list or a list under `data` or `results`.
    pub fn from_payload(payload: Value) -> Result<Self, String> {
        let body = match payload {
            Value::Object(mut map) => ["data", "results"]
                .iter()
                .find_map(|key| match map.remove(*key) {
                    Some(list @ Value::Array(_)) => Some(list),
                    _ => None,
                })
                .unwrap_or(Value::Object(map)),
            other => other,
        };
        match body {
            Value::Array(items) => Ok(Self { items }),
            other => Err(format!(
                "expected a forecast list, got {}",
                json_kind(&other)
            )),
        }
    }

    /// Group points by UTC date and average their values.
    ///
    /// Temperature points (`data_type` or `measurement_type` mentioning
    /// "temp") are used when there are any, otherwise every point is.
    /// Points without a parsable timestamp or numeric value are ignored.
    pub fn daily_averages(&self) -> Vec<ForecastDay> {
        let points: Vec<&serde_json::Map<String, Value>> =
            self.items.iter().filter_map(Value::as_object).collect();
        let temperature: Vec<_> = points
            .iter()
            .copied()
            .filter(|p| is_temperature(p))
            .collect();
        let selected = if temperature.is_empty() {
            points
        } else {
            temperature
        };

        let mut by_date: BTreeMap<NaiveDate, Vec<f64>> = BTreeMap::new();
        for point in selected {
            if let (Some(ts), Some(value)) = (point_timestamp(point), point_value(point)) {
                by_date.entry(ts.date()).or_default().push(value);
            }
        }
        by_date
            .into_iter()
            .map(|(date, values)| ForecastDay {
                date,
                avg_value: values.iter().sum::<f64>() / values.len() as f64,
                points: values.len(),
            })
            .collect()
    }
}

fn is_temperature(point: &serde_json::Map<String, Value>) -> bool {
    ["data_type", "measurement_type"].iter().any(|key| {
        point
            .get(*key)
            .and_then(Value::as_str)
            .is_some_and(|s| s.to_lowercase().contains("temp"))
    })
}

fn point_timestamp(point: &serde_json::Map<String, Value>) -> Option<NaiveDateTime> {
    let raw = ["timestamp", "time", "ts"]
        .iter()
        .find_map(|key| point.get(*key).and_then(Value::as_str))?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc).naive_utc());
    }
    [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
    ]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn point_value(point: &serde_json::Map<String, Value>) -> Option<f64> {
    let value = match point.get("value")? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_envelope_is_unwrapped() {
        let snapshot =
            WeatherSnapshot::from_payload(json!({"data": {"temp": 21.5, "wind": 3}})).unwrap();
        assert_eq!(snapshot.fields.len(), 2);
        assert_eq!(snapshot.fields["temp"], json!(21.5));
    }

    #[test]
    fn test_plain_object_kept_verbatim() {
        let snapshot =
            WeatherSnapshot::from_payload(json!({"data": "x", "humidity": 40})).unwrap();
        assert_eq!(snapshot.fields["data"], json!("x"));
        assert_eq!(snapshot.fields["humidity"], json!(40));
    }

    #[test]
    fn test_non_object_rejected() {
        let err = WeatherSnapshot::from_payload(json!([1, 2])).unwrap_err();
        assert!(err.contains("an array"));
    }

    #[test]
    fn test_forecast_list_under_data() {
        let forecast = Forecast::from_payload(json!({"data": [{"value": 1}]})).unwrap();
        assert_eq!(forecast.items.len(), 1);
        let forecast = Forecast::from_payload(json!([{"value": 1}, {"value": 2}])).unwrap();
        assert_eq!(forecast.items.len(), 2);
        assert!(Forecast::from_payload(json!({"detail": "nope"})).is_err());
    }

    #[test]
    fn test_daily_averages_prefer_temperature_points() {
        let forecast = Forecast::from_payload(json!([
            {"timestamp": "2024-06-15T09:00:00Z", "value": 20.0, "measurement_type": "Temperature"},
            {"timestamp": "2024-06-15T12:00:00Z", "value": "24", "data_type": "air_temp"},
            {"timestamp": "2024-06-15T12:00:00Z", "value": 80, "measurement_type": "humidity"},
            {"time": "2024-06-16 03:00:00", "value": 15.5, "measurement_type": "temperature"},
            {"timestamp": "not a date", "value": 99, "measurement_type": "temperature"},
            "garbage",
        ]))
        .unwrap();
        let days = forecast.daily_averages();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 6, 15).unwrap());
        assert_eq!(days[0].avg_value, 22.0);
        assert_eq!(days[0].points, 2);
        assert_eq!(days[1].avg_value, 15.5);
    }

    #[test]
    fn test_daily_averages_fall_back_to_all_points() {
        let forecast = Forecast::from_payload(json!([
            {"ts": "2024-06-15T09:00:00+02:00", "value": 4},
            {"ts": "2024-06-15T21:00:00+02:00", "value": 6},
        ]))
        .unwrap();
        let days = forecast.daily_averages();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].avg_value, 5.0);
    }

    #[test]
    fn test_display_value() {
        assert_eq!(WeatherSnapshot::display_value(&json!("sunny")), "sunny");
        assert_eq!(
            WeatherSnapshot::display_value(&json!({"a": [1, 2]})),
            "{\"a\":[1,2]}"
        );
    }
}

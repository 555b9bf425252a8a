//! HTML field report.
//!
//! [`render_html`] is a pure function of its [`ReportContext`]; writing the
//! document to disk is the caller's job.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::config::Location;
use crate::grid::GridClassification;
use crate::raster::NdviStats;
use crate::weather::WeatherSnapshot;

/// Placeholder shown when no weather snapshot is available.
pub const WEATHER_PLACEHOLDER: &str = "Weather data unavailable";

/// Placeholder shown when the snapshot carries no usable forecast.
pub const FORECAST_PLACEHOLDER: &str = "No forecast data available";

/// Relative links from the report to the other deliverables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportLinks {
    pub ndvi_preview: Option<String>,
    pub grid_overlay: Option<String>,
    pub cells_csv: Option<String>,
    pub categories_csv: Option<String>,
}

/// Everything the report shows.
#[derive(Debug, Clone)]
pub struct ReportContext<'a> {
    pub run_id: &'a str,
    pub generated_at: DateTime<Utc>,
    pub camera_profile: &'a str,
    pub location: Option<&'a Location>,
    pub ndvi_stats: Option<NdviStats>,
    pub grid: &'a GridClassification,
    pub weather: Option<&'a WeatherSnapshot>,
    pub links: ReportLinks,
}

pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn fmt_ndvi(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "n/a".to_string())
}

/// Render the report document.
pub fn render_html(ctx: &ReportContext<'_>) -> String {
    let mut html = String::new();
    let title = format!("AgriVision field report {}", ctx.run_id);

    // Writing into a String cannot fail.
    let _ = writeln!(html, "<!DOCTYPE html>");
    let _ = writeln!(html, "<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">");
    let _ = writeln!(html, "<title>{}</title>", html_escape(&title));
    let _ = writeln!(
        html,
        "<style>body{{font-family:sans-serif;margin:2em}}table{{border-collapse:collapse}}\
         td,th{{border:1px solid #ccc;padding:4px 8px}}</style>\n</head>\n<body>"
    );

    let _ = writeln!(html, "<header>\n<h1>{}</h1>", html_escape(&title));
    let _ = writeln!(html, "<dl>");
    let _ = writeln!(html, "<dt>Run</dt><dd>{}</dd>", html_escape(ctx.run_id));
    let _ = writeln!(
        html,
        "<dt>Generated</dt><dd>{}</dd>",
        ctx.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(
        html,
        "<dt>Camera</dt><dd>{}</dd>",
        html_escape(ctx.camera_profile)
    );
    if let Some(loc) = ctx.location {
        let name = loc.name.as_deref().map(html_escape).unwrap_or_default();
        let _ = writeln!(
            html,
            "<dt>Location</dt><dd>{} ({:.5}, {:.5})</dd>",
            name, loc.lat, loc.lon
        );
    }
    let _ = writeln!(html, "</dl>\n</header>");

    let _ = writeln!(html, "<section id=\"ndvi\">\n<h2>NDVI</h2>");
    match ctx.ndvi_stats {
        Some(stats) => {
            let _ = writeln!(
                html,
                "<p>Min {} / Max {} / Mean {} over {} of {} pixels</p>",
                fmt_ndvi(Some(stats.min)),
                fmt_ndvi(Some(stats.max)),
                fmt_ndvi(Some(stats.mean)),
                stats.valid_pixels,
                stats.total_pixels
            );
        }
        None => {
            let _ = writeln!(html, "<p>No valid NDVI pixels.</p>");
        }
    }
    if let Some(href) = &ctx.links.ndvi_preview {
        let _ = writeln!(
            html,
            "<p><img src=\"{0}\" alt=\"NDVI map\" style=\"max-width:100%\"></p>",
            html_escape(href)
        );
    }
    let _ = writeln!(html, "</section>");

    let summary = ctx.grid.summary();
    let _ = writeln!(html, "<section id=\"grid\">\n<h2>Grid health</h2>");
    let _ = writeln!(
        html,
        "<p>{} x {} grid, {} cells with data, {} without. Mean of cell means: {}.{}</p>",
        ctx.grid.rows,
        ctx.grid.cols,
        summary.data_cells,
        summary.no_data_cells,
        fmt_ndvi(summary.mean_ndvi),
        if ctx.grid.dynamic {
            " Thresholds were derived from the cell distribution."
        } else {
            ""
        }
    );
    let _ = writeln!(html, "<table>\n<tr><th>Class</th><th>Cells</th></tr>");
    for class in &summary.classes {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td></tr>",
            html_escape(&class.label),
            class.count
        );
    }
    let _ = writeln!(html, "</table>");
    if let Some(href) = &ctx.links.grid_overlay {
        let _ = writeln!(
            html,
            "<p><img src=\"{}\" alt=\"Grid overlay\" style=\"max-width:100%\"></p>",
            html_escape(href)
        );
    }
    let _ = writeln!(
        html,
        "<table>\n<tr><th>Cell</th><th>Mean NDVI</th><th>Class</th><th>Pixels</th></tr>"
    );
    for cell in &ctx.grid.cells {
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            html_escape(&cell.cell_id),
            fmt_ndvi(cell.mean_ndvi),
            html_escape(ctx.grid.label(cell.health)),
            cell.pixel_count
        );
    }
    let _ = writeln!(html, "</table>");
    let downloads: Vec<(&str, &String)> = [
        ("Cell CSV", ctx.links.cells_csv.as_ref()),
        ("Category CSV", ctx.links.categories_csv.as_ref()),
    ]
    .into_iter()
    .filter_map(|(name, href)| href.map(|h| (name, h)))
    .collect();
    if !downloads.is_empty() {
        let _ = writeln!(html, "<ul>");
        for (name, href) in downloads {
            let _ = writeln!(
                html,
                "<li><a href=\"{}\">{}</a></li>",
                html_escape(href),
                name
            );
        }
        let _ = writeln!(html, "</ul>");
    }
    let _ = writeln!(html, "</section>");

    let _ = writeln!(html, "<section id=\"weather\">\n<h2>Weather</h2>");
    match ctx.weather {
        Some(snapshot) => {
            let _ = writeln!(
                html,
                "<p>Fetched {}</p>\n<table>",
                snapshot.fetched_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            for (key, value) in &snapshot.fields {
                let _ = writeln!(
                    html,
                    "<tr><th>{}</th><td>{}</td></tr>",
                    html_escape(key),
                    html_escape(&WeatherSnapshot::display_value(value))
                );
            }
            let _ = writeln!(html, "</table>");
        }
        None => {
            let _ = writeln!(html, "<p>{WEATHER_PLACEHOLDER}</p>");
        }
    }
    let _ = writeln!(html, "</section>");

    let days = ctx
        .weather
        .and_then(|w| w.forecast.as_ref())
        .map(|f| f.daily_averages())
        .unwrap_or_default();
    let _ = writeln!(html, "<section id=\"forecast\">\n<h2>Forecast</h2>");
    if days.is_empty() {
        let _ = writeln!(html, "<p>{FORECAST_PLACEHOLDER}</p>");
    } else {
        let _ = writeln!(
            html,
            "<table>\n<tr><th>Date</th><th>Avg. temperature (&deg;C)</th><th>Points</th></tr>"
        );
        for day in &days {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{:.1}</td><td>{}</td></tr>",
                day.date, day.avg_value, day.points
            );
        }
        let _ = writeln!(html, "</table>");
    }
    let _ = writeln!(html, "</section>\n</body>\n</html>");
    html
}

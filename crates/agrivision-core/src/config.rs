//! Run configuration.
//!
//! The configuration is a TOML document loaded once per run. Validation happens
//! at load time: a [`RunConfig`] that exists is always internally consistent.
//!
//! ```toml
//! [ndvi]
//! thresholds = [0.2, 0.4, 0.6]
//!
//! [camera]
//! profile = "mapir_survey3"
//! bands = { red = 0, nir = 1 }
//!
//! [grid]
//! rows = 8
//! cols = 8
//!
//! [resize]
//! max_dimension = 3000
//!
//! [weather]
//! base_url = "http://127.0.0.1:8010"
//! ```

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Band names a camera profile may map to image channels.
pub const KNOWN_BANDS: [&str; 5] = ["red", "green", "blue", "nir", "red_edge"];

/// Strictly increasing NDVI class boundaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Thresholds(Vec<f64>);

impl Thresholds {
    pub fn new(values: Vec<f64>) -> Result<Self, ConfigError> {
        if values.is_empty() {
            return Err(ConfigError::EmptyThresholds);
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ConfigError::NonFiniteThreshold(values));
        }
        if values.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::NonIncreasingThresholds(values));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Number of health classes these boundaries produce.
    pub fn class_count(&self) -> usize {
        self.0.len() + 1
    }
}

/// Grid dimensions, both at least one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridSize {
    rows: u32,
    cols: u32,
}

impl GridSize {
    pub fn new(rows: i64, cols: i64) -> Result<Self, ConfigError> {
        match (u32::try_from(rows), u32::try_from(cols)) {
            (Ok(r), Ok(c)) if r >= 1 && c >= 1 => Ok(Self { rows: r, cols: c }),
            _ => Err(ConfigError::InvalidGrid { rows, cols }),
        }
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

/// NDVI classification settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NdviSettings {
    pub thresholds: Thresholds,
    /// One label per class, lowest class first.
    pub class_labels: Vec<String>,
    /// Re-derive thresholds from cell percentiles when all cells land in one class.
    pub dynamic_fallback: bool,
}

impl NdviSettings {
    pub fn label(&self, class_index: usize) -> &str {
        self.class_labels
            .get(class_index)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// Camera band name to image channel mapping (0-based channel indices).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraBands {
    pub profile: String,
    bands: BTreeMap<String, usize>,
}

impl CameraBands {
    pub fn new(profile: String, bands: BTreeMap<String, usize>) -> Result<Self, ConfigError> {
        if let Some(unknown) = bands.keys().find(|k| !KNOWN_BANDS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownBand(unknown.clone()));
        }
        for required in ["red", "nir"] {
            if !bands.contains_key(required) {
                return Err(ConfigError::MissingBand(required));
            }
        }
        Ok(Self { profile, bands })
    }

    pub fn channel(&self, band: &str) -> Option<usize> {
        self.bands.get(band).copied()
    }

    pub fn red(&self) -> usize {
        self.bands["red"]
    }

    pub fn nir(&self) -> usize {
        self.bands["nir"]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.bands.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Image resize settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResizeSettings {
    /// Longest edge, in pixels, of a resized image.
    pub max_dimension: u32,
    /// When false images are copied unchanged.
    pub enabled: bool,
}

/// Photogrammetry engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrthophotoSettings {
    pub docker_image: String,
    pub resolution_cm: f64,
    pub extra_args: Vec<String>,
    /// Interval between "still running" log lines while the engine works.
    pub heartbeat_secs: u64,
}

impl Default for OrthophotoSettings {
    fn default() -> Self {
        Self {
            docker_image: "opendronemap/odm:latest".to_string(),
            resolution_cm: 2.0,
            extra_args: Vec::new(),
            heartbeat_secs: 30,
        }
    }
}

/// Weather service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherSettings {
    pub base_url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Directory holding the service's compose recipes, relative to the project.
    #[serde(default = "default_service_dir")]
    pub service_dir: PathBuf,
    #[serde(default = "default_compose_x86_64")]
    pub compose_x86_64: String,
    #[serde(default = "default_compose_arm64")]
    pub compose_arm64: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_service_dir() -> PathBuf {
    PathBuf::from("OpenAgri-WeatherService")
}

fn default_compose_x86_64() -> String {
    "docker-compose-x86_64.yml".to_string()
}

fn default_compose_arm64() -> String {
    "docker-compose-arm64.yml".to_string()
}

/// Field location used for weather queries and the report header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub name: Option<String>,
}

/// Project directory layout overrides, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_images: PathBuf,
    pub resized_images: PathBuf,
    pub odm_project: PathBuf,
    pub ndvi_output: PathBuf,
    pub grid_output: PathBuf,
    pub reports: PathBuf,
    pub state: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_images: PathBuf::from("data/images_full"),
            resized_images: PathBuf::from("data/images_resized"),
            odm_project: PathBuf::from("data/odm_project"),
            ndvi_output: PathBuf::from("output/ndvi"),
            grid_output: PathBuf::from("output/grid"),
            reports: PathBuf::from("output/reports"),
            state: PathBuf::from(".agrivision"),
        }
    }
}

impl PathsConfig {
    fn named(&self) -> [(&'static str, &Path); 7] {
        [
            ("raw_images", &self.raw_images),
            ("resized_images", &self.resized_images),
            ("odm_project", &self.odm_project),
            ("ndvi_output", &self.ndvi_output),
            ("grid_output", &self.grid_output),
            ("reports", &self.reports),
            ("state", &self.state),
        ]
    }

    /// Every directory must be disjoint from the others: publishing a stage
    /// replaces its whole directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = self.named();
        for (i, (first, a)) in named.iter().enumerate() {
            for (second, b) in &named[i + 1..] {
                let (na, nb) = (normalize(a), normalize(b));
                if na.starts_with(&nb) || nb.starts_with(&na) {
                    return Err(ConfigError::OverlappingPaths {
                        first: *first,
                        second: *second,
                        first_path: a.to_path_buf(),
                        second_path: b.to_path_buf(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Lexical form used for overlap checks: `.` components dropped.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Stages the operator asked to skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipFlags {
    pub resize: bool,
    pub odm: bool,
    pub ndvi: bool,
    pub grid: bool,
    pub report: bool,
}

impl SkipFlags {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Immutable settings for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunConfig {
    pub ndvi: NdviSettings,
    pub camera: CameraBands,
    pub grid: GridSize,
    pub resize: ResizeSettings,
    pub orthophoto: OrthophotoSettings,
    pub weather: WeatherSettings,
    pub location: Option<Location>,
    pub paths: PathsConfig,
    pub skip: SkipFlags,
}

#[derive(Deserialize)]
struct RawConfig {
    ndvi: RawNdvi,
    camera: RawCamera,
    grid: RawGrid,
    resize: RawResize,
    weather: WeatherSettings,
    #[serde(default)]
    orthophoto: OrthophotoSettings,
    #[serde(default)]
    location: Option<Location>,
    #[serde(default)]
    paths: PathsConfig,
}

#[derive(Deserialize)]
struct RawNdvi {
    thresholds: Vec<f64>,
    #[serde(default)]
    class_labels: Option<Vec<String>>,
    #[serde(default)]
    dynamic_fallback: bool,
}

#[derive(Deserialize)]
struct RawCamera {
    #[serde(default = "default_profile")]
    profile: String,
    bands: BTreeMap<String, usize>,
}

fn default_profile() -> String {
    "default".to_string()
}

#[derive(Deserialize)]
struct RawGrid {
    rows: i64,
    cols: i64,
}

#[derive(Deserialize)]
struct RawResize {
    max_dimension: i64,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Load and validate a run configuration from `path`.
pub fn load(path: &Path) -> Result<RunConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    RunConfig::from_toml_str(&text)
}

impl RunConfig {
    /// Parse and validate a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;

        let thresholds = Thresholds::new(raw.ndvi.thresholds)?;
        let class_labels = match raw.ndvi.class_labels {
            Some(labels) if labels.len() != thresholds.class_count() => {
                return Err(ConfigError::ClassLabelCount {
                    expected: thresholds.class_count(),
                    actual: labels.len(),
                })
            }
            Some(labels) => labels,
            None => default_class_labels(thresholds.class_count()),
        };

        let max_dimension = u32::try_from(raw.resize.max_dimension)
            .ok()
            .filter(|d| *d >= 1)
            .ok_or(ConfigError::InvalidResizeDimension(raw.resize.max_dimension))?;

        let mut weather = raw.weather;
        weather.base_url = validate_service_url(&weather.base_url)?;
        raw.paths.validate()?;

        Ok(Self {
            ndvi: NdviSettings {
                thresholds,
                class_labels,
                dynamic_fallback: raw.ndvi.dynamic_fallback,
            },
            camera: CameraBands::new(raw.camera.profile, raw.camera.bands)?,
            grid: GridSize::new(raw.grid.rows, raw.grid.cols)?,
            resize: ResizeSettings {
                max_dimension,
                enabled: raw.resize.enabled,
            },
            orthophoto: raw.orthophoto,
            weather,
            location: raw.location,
            paths: raw.paths,
            skip: SkipFlags::none(),
        })
    }

    /// Apply the operator's skip flags. Called once before the run is frozen.
    pub fn with_skips(mut self, skip: SkipFlags) -> Self {
        self.skip = skip;
        self
    }

    pub fn ndvi_thresholds(&self) -> &[f64] {
        self.ndvi.thresholds.as_slice()
    }

    pub fn weather_service_url(&self) -> &str {
        &self.weather.base_url
    }
}

fn default_class_labels(count: usize) -> Vec<String> {
    if count == 3 {
        return vec!["poor".to_string(), "medium".to_string(), "good".to_string()];
    }
    (0..count).map(|i| format!("class_{i}")).collect()
}

fn validate_service_url(url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidServiceUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .ok_or_else(|| invalid("scheme must be http or https"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid("missing host"));
    }
    if rest.chars().any(char::is_whitespace) {
        return Err(invalid("contains whitespace"));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

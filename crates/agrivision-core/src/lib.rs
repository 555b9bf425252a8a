//! AgriVision core
//!
//! Domain types and pure logic for the drone imagery pipeline: the run
//! configuration, stage artifacts and their digests, run status tracking,
//! NDVI computation, grid health classification and report rendering.
//! Process and network concerns live in `agrivision-pipeline`.

pub mod artifact;
pub mod config;
pub mod error;
pub mod grid;
pub mod layout;
pub mod ndvi;
pub mod obs;
pub mod raster;
pub mod report;
pub mod run;
pub mod telemetry;
pub mod weather;

pub use artifact::{ArtifactManifest, Digest, StageArtifact};
pub use config::{
    CameraBands, GridSize, Location, NdviSettings, OrthophotoSettings, PathsConfig,
    ResizeSettings, RunConfig, SkipFlags, Thresholds, WeatherSettings,
};
pub use error::{ConfigError, PipelineError, Result};
pub use grid::{GridCell, GridClassification, GridSummary, HealthClass};
pub use layout::ProjectLayout;
pub use obs::RunSpan;
pub use raster::{NdviRaster, NdviStats};
pub use run::{Disposition, PipelineRun, PipelineWarning, RunState, Stage, StageStatus};
pub use telemetry::init_tracing;
pub use weather::{Forecast, ForecastDay, WeatherSnapshot};

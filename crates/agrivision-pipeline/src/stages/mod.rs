//! Stage executors.
//!
//! Each executor declares its inputs and its published output, and builds the
//! output inside a staging directory handed to it by [`crate::runner`]. The
//! runner owns validation, reuse and atomic publication.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use agrivision_core::artifact::swap_dir;
use agrivision_core::{ProjectLayout, Result, RunConfig, Stage, WeatherSnapshot};

pub mod grid;
pub mod ndvi;
pub mod orthophoto;
pub mod report;
pub mod resize;

pub use grid::GridStage;
pub use ndvi::NdviStage;
pub use orthophoto::OrthophotoStage;
pub use report::ReportStage;
pub use resize::ResizeStage;

/// What a stage sees of the run.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a RunConfig,
    pub layout: &'a ProjectLayout,
    pub run_id: &'a str,
    pub weather: Option<&'a WeatherSnapshot>,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Artifacts that must exist and be non-empty before the stage starts.
    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf>;

    /// Directory the stage publishes.
    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf;

    /// Primary artifact, normally inside [`Self::output_dir`].
    fn output(&self, ctx: &StageContext<'_>) -> PathBuf;

    /// Configuration values that change this stage's output.
    fn fingerprint(&self, config: &RunConfig) -> Value;

    /// Whether a previous output may be reused when its inputs are unchanged.
    fn reusable(&self) -> bool {
        true
    }

    /// Where [`Self::output`] lives inside a staging directory.
    fn staged_output(&self, ctx: &StageContext<'_>, staging: &Path) -> PathBuf {
        let output = self.output(ctx);
        match output.strip_prefix(self.output_dir(ctx)) {
            Ok(rel) => staging.join(rel),
            Err(_) => staging.join(output.file_name().unwrap_or_default()),
        }
    }

    /// Build the stage output inside `staging`, laid out like `output_dir`.
    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()>;

    /// Move a finished staging directory into place.
    fn publish(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        swap_dir(staging, &self.output_dir(ctx))?;
        Ok(())
    }
}

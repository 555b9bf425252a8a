//! NDVI raster and preview from the orthophoto.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use agrivision_core::layout::{NDVI_PREVIEW, NDVI_RASTER};
use agrivision_core::ndvi::{compute_ndvi, render_preview};
use agrivision_core::{CameraBands, PipelineError, Result, RunConfig, Stage};

use super::{StageContext, StageExecutor};

pub struct NdviStage;

#[async_trait]
impl StageExecutor for NdviStage {
    fn stage(&self) -> Stage {
        Stage::Ndvi
    }

    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf> {
        vec![ctx.layout.orthophoto()]
    }

    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.ndvi_dir()
    }

    fn output(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.ndvi_raster()
    }

    fn fingerprint(&self, config: &RunConfig) -> Value {
        json!({
            "red": config.camera.red(),
            "nir": config.camera.nir(),
        })
    }

    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let orthophoto = ctx.layout.orthophoto();
        let bands = ctx.config.camera.clone();
        let staging = staging.to_path_buf();
        tokio::task::spawn_blocking(move || build_ndvi(&orthophoto, &bands, &staging))
            .await
            .map_err(|e| PipelineError::stage_execution(Stage::Ndvi, e.to_string()))?
    }
}

fn build_ndvi(orthophoto: &Path, bands: &CameraBands, staging: &Path) -> Result<()> {
    let fail = |msg: String| PipelineError::stage_execution(Stage::Ndvi, msg);

    let image = image::open(orthophoto)
        .map_err(|e| fail(format!("cannot decode {}: {e}", orthophoto.display())))?;
    let raster = compute_ndvi(&image, bands).map_err(|e| fail(e.to_string()))?;
    raster
        .write_tiff(&staging.join(NDVI_RASTER))
        .map_err(|e| fail(e.to_string()))?;
    render_preview(&raster)
        .save(staging.join(NDVI_PREVIEW))
        .map_err(|e| fail(format!("cannot write preview: {e}")))?;

    match raster.stats() {
        Some(stats) => info!(
            width = raster.width,
            height = raster.height,
            min = stats.min,
            max = stats.max,
            mean = stats.mean,
            "NDVI computed"
        ),
        None => info!(width = raster.width, height = raster.height, "NDVI computed, no valid pixels"),
    }
    Ok(())
}

//! Grid health classification of the NDVI raster.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use agrivision_core::grid::{classify_grid, render_overlay};
use agrivision_core::layout::{GRID_CATEGORIES_CSV, GRID_CELLS_CSV, GRID_CELLS_JSON, GRID_OVERLAY};
use agrivision_core::{GridSize, NdviRaster, NdviSettings, PipelineError, Result, RunConfig, Stage};

use super::{StageContext, StageExecutor};

pub struct GridStage;

#[async_trait]
impl StageExecutor for GridStage {
    fn stage(&self) -> Stage {
        Stage::GridClassify
    }

    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf> {
        vec![ctx.layout.ndvi_raster()]
    }

    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.grid_dir()
    }

    fn output(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.grid_cells_json()
    }

    fn fingerprint(&self, config: &RunConfig) -> Value {
        json!({
            "rows": config.grid.rows(),
            "cols": config.grid.cols(),
            "thresholds": config.ndvi.thresholds,
            "class_labels": config.ndvi.class_labels,
            "dynamic_fallback": config.ndvi.dynamic_fallback,
        })
    }

    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let raster_path = ctx.layout.ndvi_raster();
        let grid = ctx.config.grid;
        let settings = ctx.config.ndvi.clone();
        let staging = staging.to_path_buf();
        tokio::task::spawn_blocking(move || build_grid(&raster_path, grid, &settings, &staging))
            .await
            .map_err(|e| PipelineError::stage_execution(Stage::GridClassify, e.to_string()))?
    }
}

fn build_grid(
    raster_path: &Path,
    grid: GridSize,
    settings: &NdviSettings,
    staging: &Path,
) -> Result<()> {
    let fail = |msg: String| PipelineError::stage_execution(Stage::GridClassify, msg);

    let raster = NdviRaster::read_tiff(raster_path)
        .map_err(|e| fail(format!("cannot read {}: {e}", raster_path.display())))?;
    let classification = classify_grid(&raster, grid, settings);

    let json = serde_json::to_vec_pretty(&classification).map_err(|e| fail(e.to_string()))?;
    fs::write(staging.join(GRID_CELLS_JSON), json)?;
    fs::write(staging.join(GRID_CELLS_CSV), classification.cells_csv())?;
    fs::write(staging.join(GRID_CATEGORIES_CSV), classification.categories_csv())?;
    render_overlay(&raster, &classification)
        .save(staging.join(GRID_OVERLAY))
        .map_err(|e| fail(format!("cannot write overlay: {e}")))?;

    let summary = classification.summary();
    info!(
        cells = classification.cells.len(),
        data_cells = summary.data_cells,
        no_data_cells = summary.no_data_cells,
        dynamic = classification.dynamic,
        "Grid classified"
    );
    Ok(())
}

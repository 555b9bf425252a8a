//! Farmer-facing HTML report and per-run snapshot.
//!
//! The report is built into a staging directory that becomes
//! `reports/runs/<run_id>/`, next to copies of the orthophoto and the NDVI and
//! grid deliverables.
//! `report_latest.html` is then refreshed from it.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use agrivision_core::artifact::copy_atomic;
use agrivision_core::layout::{
    GRID_CATEGORIES_CSV, GRID_CELLS_CSV, GRID_OVERLAY, NDVI_PREVIEW, NDVI_RASTER, ORTHOPHOTO,
    REPORT_FILE,
};
use agrivision_core::report::{render_html, ReportContext, ReportLinks};
use agrivision_core::{GridClassification, NdviRaster, PipelineError, Result, RunConfig, Stage};

use super::{StageContext, StageExecutor};

/// Staged copy of the report with links adjusted for `report_latest.html`.
const LATEST_STAGED: &str = ".latest.html";

pub struct ReportStage;

fn links(prefix: &str, present: &[&str]) -> ReportLinks {
    let link = |name: &str| {
        present
            .contains(&name)
            .then(|| format!("{prefix}{name}"))
    };
    ReportLinks {
        ndvi_preview: link(NDVI_PREVIEW),
        grid_overlay: link(GRID_OVERLAY),
        cells_csv: link(GRID_CELLS_CSV),
        categories_csv: link(GRID_CATEGORIES_CSV),
    }
}

#[async_trait]
impl StageExecutor for ReportStage {
    fn stage(&self) -> Stage {
        Stage::Report
    }

    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf> {
        vec![ctx.layout.ndvi_raster(), ctx.layout.grid_cells_json()]
    }

    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.run_report_dir(ctx.run_id)
    }

    fn output(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.report_latest()
    }

    fn staged_output(&self, _ctx: &StageContext<'_>, staging: &Path) -> PathBuf {
        staging.join(REPORT_FILE)
    }

    fn fingerprint(&self, _config: &RunConfig) -> Value {
        Value::Null
    }

    fn reusable(&self) -> bool {
        false
    }

    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let fail = |msg: String| PipelineError::stage_execution(Stage::Report, msg);
        let layout = ctx.layout;

        let raster = NdviRaster::read_tiff(&layout.ndvi_raster())
            .map_err(|e| fail(format!("cannot read NDVI raster: {e}")))?;
        let cells_path = layout.grid_cells_json();
        let grid: GridClassification = serde_json::from_slice(&fs::read(&cells_path)?)
            .map_err(|e| fail(format!("cannot parse {}: {e}", cells_path.display())))?;

        let snapshot = [
            (layout.orthophoto(), ORTHOPHOTO),
            (layout.ndvi_raster(), NDVI_RASTER),
            (layout.ndvi_preview(), NDVI_PREVIEW),
            (layout.grid_cells_csv(), GRID_CELLS_CSV),
            (layout.grid_categories_csv(), GRID_CATEGORIES_CSV),
            (layout.grid_overlay(), GRID_OVERLAY),
        ];
        let mut present = Vec::new();
        for (src, name) in snapshot {
            if src.is_file() {
                fs::copy(&src, staging.join(name))?;
                present.push(name);
            } else {
                debug!(path = %src.display(), "Not in snapshot, file absent");
            }
        }

        let mut report = ReportContext {
            run_id: ctx.run_id,
            generated_at: chrono::Utc::now(),
            camera_profile: &ctx.config.camera.profile,
            location: ctx.config.location.as_ref(),
            ndvi_stats: raster.stats(),
            grid: &grid,
            weather: ctx.weather,
            links: links("", &present),
        };
        fs::write(staging.join(REPORT_FILE), render_html(&report))?;

        report.links = links(&format!("runs/{}/", ctx.run_id), &present);
        fs::write(staging.join(LATEST_STAGED), render_html(&report))?;

        info!(
            weather = ctx.weather.is_some(),
            files = present.len(),
            "Report rendered"
        );
        Ok(())
    }

    fn publish(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let run_dir = self.output_dir(ctx);
        agrivision_core::artifact::swap_dir(staging, &run_dir)?;
        let latest = run_dir.join(LATEST_STAGED);
        copy_atomic(&latest, &ctx.layout.report_latest())?;
        fs::remove_file(&latest)?;
        Ok(())
    }
}

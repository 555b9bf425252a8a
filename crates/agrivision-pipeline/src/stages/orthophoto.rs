//! Orthophoto build through the photogrammetry engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use agrivision_core::layout::orthophoto_in;
use agrivision_core::{PipelineError, ProjectLayout, Result, RunConfig, Stage};

use super::resize::list_images;
use super::{StageContext, StageExecutor};
use crate::engine::{EngineRequest, PhotogrammetryEngine};

pub struct OrthophotoStage {
    engine: Arc<dyn PhotogrammetryEngine>,
}

impl OrthophotoStage {
    pub fn new(engine: Arc<dyn PhotogrammetryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl StageExecutor for OrthophotoStage {
    fn stage(&self) -> Stage {
        Stage::Orthophoto
    }

    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf> {
        vec![ctx.layout.resized_images()]
    }

    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.odm_root()
    }

    fn output(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.orthophoto()
    }

    fn fingerprint(&self, config: &RunConfig) -> Value {
        json!({
            "docker_image": config.orthophoto.docker_image,
            "resolution_cm": config.orthophoto.resolution_cm,
            "extra_args": config.orthophoto.extra_args,
        })
    }

    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let project = staging.join(ProjectLayout::ODM_PROJECT);
        let images_dir = project.join("images");
        fs::create_dir_all(&images_dir)?;
        let images = list_images(&ctx.layout.resized_images())?;
        for src in &images {
            fs::copy(src, images_dir.join(src.file_name().unwrap_or_default()))?;
        }
        info!(images = images.len(), "Prepared photogrammetry project");

        let request = EngineRequest {
            datasets_root: staging.to_path_buf(),
            project: ProjectLayout::ODM_PROJECT.to_string(),
            resolution_cm: ctx.config.orthophoto.resolution_cm,
            extra_args: ctx.config.orthophoto.extra_args.clone(),
        };
        self.engine
            .build(&request)
            .await
            .map_err(|e| PipelineError::StageExecution {
                stage: Stage::Orthophoto,
                message: e.to_string(),
                diagnostics: e.diagnostics(),
            })?;

        let orthophoto = orthophoto_in(&project);
        if !orthophoto.is_file() {
            return Err(PipelineError::stage_execution(
                Stage::Orthophoto,
                format!(
                    "engine finished but produced no orthophoto at {}",
                    orthophoto.display()
                ),
            ));
        }
        Ok(())
    }
}

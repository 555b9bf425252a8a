//! Resize raw images so the photogrammetry engine gets a bounded input size.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::imageops::FilterType;
use serde_json::{json, Value};
use tracing::{debug, info};

use agrivision_core::artifact::list_visible_files;
use agrivision_core::{PipelineError, Result, RunConfig, Stage};

use super::{StageContext, StageExecutor};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

/// Image files directly inside `dir`, sorted by name.
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(list_visible_files(dir)?
        .into_iter()
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect())
}

/// Target size that fits `(width, height)` inside `max_dimension`, or `None`
/// when the image already fits.
pub fn target_size(width: u32, height: u32, max_dimension: u32) -> Option<(u32, u32)> {
    let long = width.max(height);
    if long <= max_dimension {
        return None;
    }
    let scale = f64::from(max_dimension) / f64::from(long);
    let scaled = |v: u32| ((f64::from(v) * scale).floor() as u32).max(1);
    Some((scaled(width), scaled(height)))
}

pub struct ResizeStage;

#[async_trait]
impl StageExecutor for ResizeStage {
    fn stage(&self) -> Stage {
        Stage::Resize
    }

    fn inputs(&self, ctx: &StageContext<'_>) -> Vec<PathBuf> {
        vec![ctx.layout.raw_images()]
    }

    fn output_dir(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.resized_images()
    }

    fn output(&self, ctx: &StageContext<'_>) -> PathBuf {
        ctx.layout.resized_images()
    }

    fn fingerprint(&self, config: &RunConfig) -> Value {
        json!({
            "max_dimension": config.resize.max_dimension,
            "enabled": config.resize.enabled,
        })
    }

    async fn produce(&self, ctx: &StageContext<'_>, staging: &Path) -> Result<()> {
        let raw = ctx.layout.raw_images();
        let images = list_images(&raw)?;
        if images.is_empty() {
            return Err(PipelineError::missing(
                Stage::Resize,
                raw,
                "no jpg, png or tif images found",
            ));
        }

        let settings = ctx.config.resize;
        let staging = staging.to_path_buf();
        let count = images.len();
        tokio::task::spawn_blocking(move || -> Result<()> {
            for src in &images {
                let name = src.file_name().unwrap_or_default();
                resize_one(src, &staging.join(name), settings.max_dimension, settings.enabled)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::stage_execution(Stage::Resize, e.to_string()))??;

        info!(images = count, max_dimension = settings.max_dimension, "Images resized");
        Ok(())
    }
}

fn resize_one(src: &Path, dest: &Path, max_dimension: u32, enabled: bool) -> Result<()> {
    let fail = |e: image::ImageError| {
        PipelineError::stage_execution(Stage::Resize, format!("{}: {e}", src.display()))
    };
    let target = if enabled {
        let (w, h) = image::image_dimensions(src).map_err(fail)?;
        target_size(w, h, max_dimension)
    } else {
        None
    };
    match target {
        None => {
            fs::copy(src, dest)?;
            debug!(image = %src.display(), "Copied unchanged");
        }
        Some((w, h)) => {
            let img = image::open(src).map_err(fail)?;
            img.resize_exact(w, h, FilterType::Lanczos3)
                .save(dest)
                .map_err(fail)?;
            debug!(image = %src.display(), width = w, height = h, "Resized");
        }
    }
    Ok(())
}

//! Single-stage execution: validate, reuse or rebuild, publish.

use std::path::Path;

use serde_json::json;
use tracing::{debug, info};

use agrivision_core::artifact::{check_non_empty, digest_path, ArtifactManifest, Digest};
use agrivision_core::{PipelineError, Result, StageArtifact};

use crate::stages::{StageContext, StageExecutor};

/// Result of running one stage.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub artifact: StageArtifact,
    /// True when a previous output was kept instead of recomputed.
    pub reused: bool,
}

/// Check that every input of `executor` is present and non-empty.
pub fn validate_inputs(executor: &dyn StageExecutor, ctx: &StageContext<'_>) -> Result<()> {
    for input in executor.inputs(ctx) {
        check_non_empty(&input)
            .map_err(|reason| PipelineError::missing(executor.stage(), &input, reason))?;
    }
    Ok(())
}

/// Digest of the stage inputs plus its configuration fingerprint.
pub fn inputs_digest(executor: &dyn StageExecutor, ctx: &StageContext<'_>) -> Result<Digest> {
    let mut inputs = Vec::new();
    for input in executor.inputs(ctx) {
        inputs.push(digest_path(&input)?.to_hex());
    }
    let fingerprint = json!({
        "stage": executor.stage(),
        "inputs": inputs,
        "config": executor.fingerprint(ctx.config),
    });
    Digest::of_json(&fingerprint).map_err(|e| PipelineError::Io(e.into()))
}

fn reusable_artifact(
    executor: &dyn StageExecutor,
    ctx: &StageContext<'_>,
    inputs_digest: &Digest,
) -> Option<StageArtifact> {
    let manifest = ArtifactManifest::load(&executor.output_dir(ctx))?;
    if manifest.stage != executor.stage() || manifest.inputs_digest != *inputs_digest {
        debug!(stage = %executor.stage(), "Inputs changed since last build");
        return None;
    }
    let artifact = StageArtifact::at(executor.stage(), executor.output(ctx))
        .inspect()
        .ok()?;
    (artifact.digest == Some(manifest.output_digest)).then_some(artifact)
}

/// Run `executor`, reusing a valid previous output unless `force` is set.
pub async fn run_stage(
    executor: &dyn StageExecutor,
    ctx: &StageContext<'_>,
    force: bool,
) -> Result<StageOutcome> {
    let stage = executor.stage();
    validate_inputs(executor, ctx)?;

    let digest = if executor.reusable() {
        let digest = inputs_digest(executor, ctx)?;
        if !force {
            if let Some(artifact) = reusable_artifact(executor, ctx, &digest) {
                info!(stage = %stage, path = %artifact.path.display(), "Reusing existing artifact");
                return Ok(StageOutcome {
                    artifact,
                    reused: true,
                });
            }
        }
        Some(digest)
    } else {
        None
    };

    let output_dir = executor.output_dir(ctx);
    let parent = output_dir.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)?;

    executor.produce(ctx, staging.path()).await?;

    let output = executor.output(ctx);
    let staged_output = executor.staged_output(ctx, staging.path());
    check_non_empty(&staged_output).map_err(|reason| {
        PipelineError::stage_execution(
            stage,
            format!("produced no output at {}: {reason}", output.display()),
        )
    })?;

    if let Some(inputs_digest) = digest {
        let manifest = ArtifactManifest {
            stage,
            inputs_digest,
            output_digest: digest_path(&staged_output)?,
            run_id: ctx.run_id.to_string(),
            created_at: chrono::Utc::now(),
        };
        manifest.save(staging.path())?;
    }

    executor.publish(ctx, staging.path())?;
    let artifact = StageArtifact::at(stage, output).inspect().map_err(|reason| {
        PipelineError::stage_execution(stage, format!("published artifact {reason}"))
    })?;
    Ok(StageOutcome {
        artifact,
        reused: false,
    })
}

/// Validate the output a skipped stage would have produced.
pub fn validate_skipped(
    executor: &dyn StageExecutor,
    ctx: &StageContext<'_>,
) -> Result<StageArtifact> {
    let output = executor.output(ctx);
    StageArtifact::at(executor.stage(), &output)
        .inspect()
        .map_err(|reason| PipelineError::missing(executor.stage(), &output, reason))
}

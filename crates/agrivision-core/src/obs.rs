//! Run lifecycle events.
//!
//! Every event carries an `event` field (`run.started`, `stage.finished`, ...)
//! so JSON logs can be filtered without parsing messages.

use tracing::{info, warn};

use crate::run::{Disposition, Stage, StageStatus};

/// RAII guard that keeps a run-scoped span entered for the duration of a run.
///
/// ```ignore
/// let _span = RunSpan::enter("20240615_093012");
/// // every event logged here carries run_id = "20240615_093012"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The run-scoped span itself, for instrumenting async work.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("agrivision.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, project: &std::path::Path) {
    info!(event = "run.started", run_id = %run_id, project = %project.display());
}

pub fn emit_stage_started(run_id: &str, stage: Stage) {
    info!(event = "stage.started", run_id = %run_id, stage = %stage);
}

/// Emit event: stage left the `RUNNING` state.
pub fn emit_stage_finished(
    run_id: &str,
    stage: Stage,
    status: StageStatus,
    duration_ms: u64,
    reused: bool,
) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        status = ?status,
        duration_ms = duration_ms,
        reused = reused,
    );
}

/// Emit event: stage skipped, with the existing artifact it relies on.
pub fn emit_stage_skipped(run_id: &str, stage: Stage, artifact: &std::path::Path) {
    info!(
        event = "stage.skipped",
        run_id = %run_id,
        stage = %stage,
        artifact = %artifact.display(),
    );
}

pub fn emit_run_finished(run_id: &str, disposition: Disposition, duration_ms: u64) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        disposition = ?disposition,
        duration_ms = duration_ms,
    );
}

/// Emit event: weather data could not be obtained (warning level).
pub fn emit_weather_unavailable(run_id: &str, reason: &str) {
    warn!(event = "weather.unavailable", run_id = %run_id, reason = %reason);
}

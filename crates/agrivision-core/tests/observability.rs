//! Observability tests for run lifecycle tracing.

use std::path::Path;

use agrivision_core::obs::{
    emit_run_finished, emit_run_started, emit_stage_finished, emit_stage_skipped,
    emit_stage_started, emit_weather_unavailable,
};
use agrivision_core::{Disposition, RunSpan, Stage, StageStatus};
use tracing_test::traced_test;

#[traced_test]
#[test]
fn test_run_lifecycle_events_are_emitted() {
    let _span = RunSpan::enter("20240615_093012");
    emit_run_started("20240615_093012", Path::new("/fields/north"));
    emit_stage_started("20240615_093012", Stage::Resize);
    emit_stage_finished("20240615_093012", Stage::Resize, StageStatus::Done, 40, true);
    emit_run_finished("20240615_093012", Disposition::Done, 1200);

    assert!(logs_contain("run.started"));
    assert!(logs_contain("/fields/north"));
    assert!(logs_contain("reused=true"));
    assert!(logs_contain("run.finished"));
}

#[traced_test]
#[test]
fn test_stage_skipped_names_artifact() {
    emit_stage_skipped("r-skip", Stage::Orthophoto, Path::new("/p/odm_orthophoto.tif"));
    assert!(logs_contain("stage.skipped"));
    assert!(logs_contain("odm_orthophoto.tif"));
}

#[traced_test]
#[test]
fn test_weather_unavailable_logs_at_warn() {
    emit_weather_unavailable("r-weather", "probe timed out");
    assert!(logs_contain("WARN"));
    assert!(logs_contain("probe timed out"));
}

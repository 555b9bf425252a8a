//! Run and stage status tracking.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::StageArtifact;
use crate::error::ConfigError;

/// Pipeline stages in dependency order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resize,
    Orthophoto,
    Ndvi,
    GridClassify,
    Report,
}

impl Stage {
    /// All stages, in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Resize,
        Stage::Orthophoto,
        Stage::Ndvi,
        Stage::GridClassify,
        Stage::Report,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Resize => "resize",
            Stage::Orthophoto => "orthophoto",
            Stage::Ndvi => "ndvi",
            Stage::GridClassify => "grid_classify",
            Stage::Report => "report",
        }
    }

    /// The stage that follows this one, or `None` after `Report`.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Resize => Some(Stage::Orthophoto),
            Stage::Orthophoto => Some(Stage::Ndvi),
            Stage::Ndvi => Some(Stage::GridClassify),
            Stage::GridClassify => Some(Stage::Report),
            Stage::Report => None,
        }
    }

    fn index(&self) -> usize {
        Stage::ALL
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum StageStatus {
    Pending,
    Skipped,
    Running,
    Done,
    Failed,
}

/// Position of the orchestrator's state machine.
///
/// `Done` and `Failed` are terminal; `Failed` is reachable from every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    At(Stage),
    Done,
    Failed(Stage),
}

impl RunState {
    pub fn initial() -> Self {
        RunState::At(Stage::Resize)
    }

    /// Transition after the current stage finished successfully or was skipped.
    pub fn advance(self) -> Self {
        match self {
            RunState::At(stage) => stage.next().map(RunState::At).unwrap_or(RunState::Done),
            terminal => terminal,
        }
    }

    /// Transition into the absorbing failure state.
    pub fn fail(self) -> Self {
        match self {
            RunState::At(stage) => RunState::Failed(stage),
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::At(_))
    }
}

/// Non-fatal conditions recorded on a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// The weather service could not be reached; the report carries a placeholder.
    WeatherUnavailable(String),
    /// A stale run lock from a dead process was removed.
    StaleLockRemoved(String),
}

impl fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineWarning::WeatherUnavailable(reason) => {
                write!(f, "weather unavailable: {reason}")
            }
            PipelineWarning::StaleLockRemoved(detail) => {
                write!(f, "stale run lock removed: {detail}")
            }
        }
    }
}

/// Final disposition of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Disposition {
    Running,
    Done,
    Failed,
    Interrupted,
}

/// Per-stage entry of a [`PipelineRun`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub artifact: Option<StageArtifact>,
    /// True when an existing valid artifact was reused instead of recomputed.
    pub reused: bool,
    pub error: Option<String>,
}

impl StageRecord {
    fn pending(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            artifact: None,
            reused: false,
            error: None,
        }
    }
}

/// A single invocation of the pipeline against one project directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<PipelineWarning>,
    pub disposition: Disposition,
}

impl PipelineRun {
    /// Create a run with every stage `PENDING`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            stages: Stage::ALL.iter().map(|s| StageRecord::pending(*s)).collect(),
            warnings: Vec::new(),
            disposition: Disposition::Running,
        }
    }

    pub fn record(&self, stage: Stage) -> &StageRecord {
        &self.stages[stage.index()]
    }

    fn record_mut(&mut self, stage: Stage) -> &mut StageRecord {
        &mut self.stages[stage.index()]
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.record(stage).status
    }

    pub fn mark_running(&mut self, stage: Stage) {
        let record = self.record_mut(stage);
        record.status = StageStatus::Running;
        record.started_at = Some(Utc::now());
    }

    pub fn mark_done(&mut self, stage: Stage, artifact: StageArtifact, reused: bool) {
        let record = self.record_mut(stage);
        record.status = StageStatus::Done;
        record.artifact = Some(artifact);
        record.reused = reused;
        Self::close(record);
    }

    pub fn mark_skipped(&mut self, stage: Stage, artifact: StageArtifact) {
        let record = self.record_mut(stage);
        record.status = StageStatus::Skipped;
        record.artifact = Some(artifact);
    }

    pub fn mark_failed(&mut self, stage: Stage, error: impl Into<String>) {
        let record = self.record_mut(stage);
        record.status = StageStatus::Failed;
        record.error = Some(error.into());
        Self::close(record);
    }

    pub fn warn(&mut self, warning: PipelineWarning) {
        self.warnings.push(warning);
    }

    pub fn finish(&mut self, disposition: Disposition) {
        self.disposition = disposition;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.stages
            .iter()
            .find(|r| r.status == StageStatus::Failed)
            .map(|r| r.stage)
    }

    fn close(record: &mut StageRecord) {
        let now = Utc::now();
        record.finished_at = Some(now);
        if let Some(started) = record.started_at {
            record.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// Timestamp-derived run id, e.g. `20240615_093012`.
pub fn generate_run_id() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Check a user-provided run id; it becomes a directory name.
pub fn validate_run_id(run_id: &str) -> Result<(), ConfigError> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidRunId(run_id.to_string()))
    }
}

//! Error taxonomy for AgriVision runs.
//!
//! Every fatal condition a run can hit is a [`PipelineError`]. Configuration
//! problems are detailed by [`ConfigError`] and always surface before any
//! stage has started.

use std::path::PathBuf;

use crate::run::Stage;

/// Errors produced while loading or validating a run configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("ndvi thresholds must not be empty")]
    EmptyThresholds,

    #[error("ndvi thresholds must be finite numbers, got {0:?}")]
    NonFiniteThreshold(Vec<f64>),

    #[error("ndvi thresholds must be strictly increasing, got {0:?}")]
    NonIncreasingThresholds(Vec<f64>),

    #[error("class labels: expected {expected} labels for the configured thresholds, got {actual}")]
    ClassLabelCount { expected: usize, actual: usize },

    #[error("grid dimensions must be positive integers, got {rows}x{cols}")]
    InvalidGrid { rows: i64, cols: i64 },

    #[error("unknown camera band name: {0}")]
    UnknownBand(String),

    #[error("camera band mapping is missing required band: {0}")]
    MissingBand(&'static str),

    #[error("resize max dimension must be at least 1, got {0}")]
    InvalidResizeDimension(i64),

    #[error("invalid weather service url '{url}': {reason}")]
    InvalidServiceUrl { url: String, reason: String },

    #[error(
        "paths.{first} ({}) and paths.{second} ({}) must not be the same or nested directories",
        first_path.display(),
        second_path.display()
    )]
    OverlappingPaths {
        first: &'static str,
        second: &'static str,
        first_path: PathBuf,
        second_path: PathBuf,
    },

    #[error("invalid run id '{0}': only letters, digits, '_', '-' and '.' are allowed")]
    InvalidRunId(String),
}

/// Fatal errors that halt a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("stage '{stage}' is missing a prerequisite at {}: {reason}", path.display())]
    MissingPrerequisite {
        stage: Stage,
        path: PathBuf,
        reason: String,
    },

    #[error("stage '{stage}' failed: {message}")]
    StageExecution {
        stage: Stage,
        message: String,
        /// Diagnostic output of the failing tool, when there is any.
        diagnostics: Option<String>,
    },

    #[error("another run '{run_id}' is already active in this project (pid {pid})")]
    ConcurrentRun { pid: u32, run_id: String },

    #[error("run interrupted before stage '{before_stage}'")]
    Interrupted { before_stage: Stage },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Shorthand for a [`PipelineError::StageExecution`] without diagnostics.
    pub fn stage_execution(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::StageExecution {
            stage,
            message: message.into(),
            diagnostics: None,
        }
    }

    /// Shorthand for a [`PipelineError::MissingPrerequisite`].
    pub fn missing(stage: Stage, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::MissingPrerequisite {
            stage,
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The stage this error is attributed to, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::MissingPrerequisite { stage, .. }
            | PipelineError::StageExecution { stage, .. } => Some(*stage),
            PipelineError::Interrupted { before_stage } => Some(*before_stage),
            _ => None,
        }
    }

    /// Process exit code for this error. Zero is reserved for a `DONE` run.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::MissingPrerequisite { .. } => 3,
            PipelineError::StageExecution { .. } => 4,
            PipelineError::ConcurrentRun { .. } => 5,
            PipelineError::Interrupted { .. } => 130,
            PipelineError::Io(_) => 1,
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

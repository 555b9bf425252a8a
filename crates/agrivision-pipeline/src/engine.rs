//! Photogrammetry engine adapter.
//!
//! The engine turns a directory of images into an orthophoto. The production
//! engine is OpenDroneMap run through docker; tests substitute their own
//! [`PhotogrammetryEngine`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use agrivision_core::OrthophotoSettings;

use crate::process::run_supervised;

/// One engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    /// Directory mounted as the engine's dataset root.
    pub datasets_root: PathBuf,
    /// Project directory name under `datasets_root`; images are in `<project>/images`.
    pub project: String,
    pub resolution_cm: f64,
    pub extra_args: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start photogrammetry engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("photogrammetry engine exited with {}", exit_code.map_or("a signal".to_string(), |c| format!("code {c}")))]
    Failed {
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

impl EngineError {
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            EngineError::Failed { stderr_tail, .. } if !stderr_tail.is_empty() => {
                Some(stderr_tail.clone())
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait PhotogrammetryEngine: Send + Sync {
    /// Build the orthophoto for `request`, writing under `request.datasets_root`.
    async fn build(&self, request: &EngineRequest) -> Result<(), EngineError>;
}

/// OpenDroneMap in a docker container.
#[derive(Debug, Clone)]
pub struct OdmDockerEngine {
    pub image: String,
    pub heartbeat: Duration,
}

impl OdmDockerEngine {
    pub fn from_settings(settings: &OrthophotoSettings) -> Self {
        Self {
            image: settings.docker_image.clone(),
            heartbeat: Duration::from_secs(settings.heartbeat_secs.max(1)),
        }
    }

    /// Absolute form of the dataset root; docker rejects relative bind sources.
    pub fn mount_source(datasets_root: &Path) -> std::io::Result<PathBuf> {
        std::fs::canonicalize(datasets_root)
    }

    /// Arguments passed to `docker`.
    pub fn args(&self, request: &EngineRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/datasets", request.datasets_root.display()),
            self.image.clone(),
            "--project-path".to_string(),
            "/datasets".to_string(),
            request.project.clone(),
            "--orthophoto-resolution".to_string(),
            request.resolution_cm.to_string(),
            "--skip-3dmodel".to_string(),
            "--skip-report".to_string(),
        ];
        args.extend(request.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl PhotogrammetryEngine for OdmDockerEngine {
    async fn build(&self, request: &EngineRequest) -> Result<(), EngineError> {
        let request = EngineRequest {
            datasets_root: Self::mount_source(&request.datasets_root).map_err(EngineError::Spawn)?,
            ..request.clone()
        };
        let args = self.args(&request);
        info!(image = %self.image, root = %request.datasets_root.display(), "Starting OpenDroneMap");
        let mut command = Command::new("docker");
        command.args(&args);
        let outcome = run_supervised(command, "odm", self.heartbeat)
            .await
            .map_err(EngineError::Spawn)?;
        if outcome.success() {
            info!(duration_ms = outcome.duration_ms, "OpenDroneMap finished");
            Ok(())
        } else {
            Err(EngineError::Failed {
                exit_code: outcome.status.code(),
                stderr_tail: outcome.stderr_tail,
            })
        }
    }
}

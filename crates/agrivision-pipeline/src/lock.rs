//! Per-project run lock.
//!
//! A JSON marker file created with `create_new`. The guard removes the marker
//! on drop, but only while it still records this process and run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use agrivision_core::{PipelineError, PipelineWarning, Result};

/// Contents of the lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Whether process `pid` is still running.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Whether process `pid` is still running. Without procfs every holder is
/// treated as alive.
#[cfg(not(target_os = "linux"))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
}

impl RunLock {
    /// Acquire the lock at `path` for `run_id`.
    ///
    /// A marker left by a dead process is removed and reported as a warning.
    pub fn acquire(path: &Path, run_id: &str) -> Result<(Self, Option<PipelineWarning>)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let record = LockRecord {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            acquired_at: Utc::now(),
        };

        let mut stale = None;
        for _attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let json = serde_json::to_vec_pretty(&record).map_err(std::io::Error::from)?;
                    file.write_all(&json)?;
                    file.sync_all()?;
                    debug!(path = %path.display(), "Run lock acquired");
                    let lock = Self {
                        path: path.to_path_buf(),
                        record,
                    };
                    return Ok((lock, stale));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = read_record(path);
                    if let Some(holder) = &holder {
                        if process_alive(holder.pid) {
                            return Err(PipelineError::ConcurrentRun {
                                pid: holder.pid,
                                run_id: holder.run_id.clone(),
                            });
                        }
                    }
                    let detail = match holder {
                        Some(h) => format!("run '{}' (pid {}) is no longer running", h.run_id, h.pid),
                        None => "lock file was unreadable".to_string(),
                    };
                    warn!(path = %path.display(), detail = %detail, "Removing stale run lock");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    stale = Some(PipelineWarning::StaleLockRemoved(detail));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(PipelineError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("run lock {} was re-created while acquiring it", path.display()),
        )))
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match read_record(&self.path) {
            Some(current) if current.pid == self.record.pid && current.run_id == self.record.run_id => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
                } else {
                    debug!(path = %self.path.display(), "Run lock released");
                }
            }
            _ => warn!(path = %self.path.display(), "Run lock no longer ours, leaving it in place"),
        }
    }
}

//! Supervised execution of external tools.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

/// Lines of stderr kept for diagnostics.
pub const STDERR_TAIL_LINES: usize = 40;

/// Exit status and the last lines of stderr of a finished process.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stderr_tail: String,
    pub duration_ms: u64,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `command` to completion.
///
/// Stdout is forwarded to debug logs, stderr is kept as a rolling tail and a
/// heartbeat line is logged every `heartbeat` while the process runs. The child
/// is killed if the returned future is dropped.
pub async fn run_supervised(
    mut command: Command,
    label: &str,
    heartbeat: Duration,
) -> std::io::Result<ProcessOutcome> {
    let start = Instant::now();
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let tool = label.to_string();
    let stdout_task = tokio::spawn(async move {
        if let Some(out) = stdout {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(tool = %tool, "{line}");
            }
        }
    });
    let stderr_task = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(err) = stderr {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
        Vec::from(tail).join("\n")
    });

    let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_millis(10)));
    ticker.tick().await;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = ticker.tick() => {
                info!(
                    event = "process.heartbeat",
                    tool = %label,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Still running"
                );
            }
        }
    };

    let _ = stdout_task.await;
    let stderr_tail = stderr_task.await.unwrap_or_default();
    Ok(ProcessOutcome {
        status,
        stderr_tail,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

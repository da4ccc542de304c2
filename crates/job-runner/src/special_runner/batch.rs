// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch system submission.
//!
//! A batch type `<t>` is driven through three helper commands:
//! `<t>_submit <script> <outfile> <errfile>` prints the batch job id,
//! `<t>_checkjob <id>` prints `Pending`, `Running` or `Finished`, and
//! `<t>_cancel <id>` cancels the job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::debug;

use crate::logger::{JobLogger, LogLine};
use crate::runtime::{Result, RuntimeError};

/// Batch job states reported by `<t>_checkjob`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    /// Queued.
    Pending,
    /// Executing.
    Running,
    /// Done.
    Finished,
    /// Anything else the helper printed.
    Other(String),
}

impl From<&str> for BatchState {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Finished" => Self::Finished,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Helper commands of one batch type.
#[derive(Debug, Clone)]
pub struct BatchCommands {
    bin_dir: Option<PathBuf>,
    batch_type: String,
}

impl BatchCommands {
    /// Commands for `batch_type`, looked up in `bin_dir` or PATH.
    pub fn new(bin_dir: Option<PathBuf>, batch_type: impl Into<String>) -> Self {
        Self {
            bin_dir,
            batch_type: batch_type.into(),
        }
    }

    fn command(&self, action: &str) -> Command {
        let name = format!("{}_{}", self.batch_type, action);
        match &self.bin_dir {
            Some(dir) => Command::new(dir.join(name)),
            None => Command::new(name),
        }
    }

    async fn output(&self, action: &str, mut cmd: Command) -> Result<String> {
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(RuntimeError::Command {
                command: format!("{}_{}", self.batch_type, action),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Submit `script` from `dir`, returning the batch job id.
    pub async fn submit(
        &self,
        dir: &Path,
        script: &str,
        outfile: &str,
        errfile: &str,
    ) -> Result<String> {
        let mut cmd = self.command("submit");
        cmd.args([script, outfile, errfile]).current_dir(dir);
        let batch_id = self.output("submit", cmd).await?;
        if batch_id.is_empty() {
            return Err(RuntimeError::StartFailed(format!(
                "{}_submit returned no job id",
                self.batch_type
            )));
        }
        Ok(batch_id)
    }

    /// Current state of a batch job.
    pub async fn check(&self, batch_id: &str) -> Result<BatchState> {
        let mut cmd = self.command("checkjob");
        cmd.arg(batch_id);
        Ok(BatchState::from(self.output("checkjob", cmd).await?.trim()))
    }

    /// Cancel a batch job. Failures are ignored.
    pub async fn cancel(&self, batch_id: &str) {
        let mut cmd = self.command("cancel");
        cmd.arg(batch_id);
        if let Err(e) = self.output("cancel", cmd).await {
            debug!(batch_id = %batch_id, error = %e, "Batch cancel failed");
        }
    }
}

/// Incremental reader of a file another process appends to.
#[derive(Debug)]
struct Tail {
    path: PathBuf,
    offset: u64,
    is_error: bool,
}

impl Tail {
    fn new(path: PathBuf, is_error: bool) -> Self {
        Self {
            path,
            offset: 0,
            is_error,
        }
    }

    /// Complete lines appended since the last read. With `flush` a trailing
    /// partial line is returned too.
    async fn read_new(&mut self, flush: bool) -> std::io::Result<Vec<LogLine>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let consumed = if flush {
            buf.len()
        } else {
            buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
        };
        self.offset += consumed as u64;
        Ok(String::from_utf8_lossy(&buf[..consumed])
            .lines()
            .map(|l| LogLine {
                line: l.to_string(),
                is_error: self.is_error,
                ts: None,
            })
            .collect())
    }
}

/// Wait for a submitted batch job to start, stream its output and error
/// files into the job log until it stops running, and produce its result.
pub async fn watch_batch(
    commands: BatchCommands,
    batch_id: String,
    outfile: PathBuf,
    errfile: PathBuf,
    poll: Duration,
    logger: JobLogger,
) -> Result<Option<Value>> {
    logger.log(format!("Watching batch job ID {}", batch_id)).await;

    let mut started = false;
    loop {
        match commands.check(&batch_id).await? {
            BatchState::Running => {
                if !started {
                    logger.log("Running").await;
                }
                started = true;
            }
            BatchState::Pending => logger.log("Pending").await,
            BatchState::Finished => break,
            BatchState::Other(state) => {
                debug!(batch_id = %batch_id, state = %state, "Unknown batch state")
            }
        }
        if started && outfile.exists() {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    let mut tails = Vec::new();
    if outfile.exists() {
        tails.push(Tail::new(outfile, false));
    } else {
        logger.error("No output file generated").await;
    }
    if errfile.exists() {
        tails.push(Tail::new(errfile, true));
    } else {
        logger.error("No error file generated").await;
    }

    while !tails.is_empty() {
        let running = commands.check(&batch_id).await? == BatchState::Running;
        for tail in &mut tails {
            logger.log_lines(tail.read_new(!running).await?).await;
        }
        if !running {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    Ok(Some(json!({ "result": [{ "exit_status": 0 }] })))
}

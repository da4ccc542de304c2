// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background supervision of started units of work.
//!
//! [`supervise`] runs a backend's watch future and, whatever happens to it,
//! runs the backend's finalizer and then publishes exactly one completion
//! message per queue. The watch future runs in its own task so an error or a
//! panic inside it still reaches the notification step.

use std::collections::HashMap;
use std::future::Future;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::job::{JobError, RUNNER_ERROR_CODE};
use crate::message::{Message, MessageSender, broadcast};

/// Which completion message a supervised unit publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Container unit: `finished`, output is read from the workspace.
    Container,
    /// Batch/WDL unit: `finished_special` carrying the result.
    Special,
}

fn completion(kind: UnitKind, job_id: String, result: Option<Value>) -> Message {
    match kind {
        UnitKind::Container => Message::Finished {
            job_id,
            output: result,
        },
        UnitKind::Special => Message::FinishedSpecial {
            job_id,
            result: result.unwrap_or_else(|| serde_json::json!({})),
        },
    }
}

fn watcher_failure(reason: impl std::fmt::Display) -> Value {
    JobError::new(RUNNER_ERROR_CODE, "Watcher failed", reason.to_string()).into_payload()
}

/// Supervise one unit of work.
///
/// `watch` resolves when the unit has terminated, optionally with a result.
/// `finalize` runs afterwards on every path (final log flush, removal).
/// Special units that fail to watch report an error result, container units
/// report no output and let the workspace decide.
pub fn supervise<W, F, Fut, E>(
    kind: UnitKind,
    job_id: String,
    queues: Vec<MessageSender>,
    watch: W,
    finalize: F,
) -> JoinHandle<()>
where
    W: Future<Output = Result<Option<Value>, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(watch).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Unexpected failure while watching unit");
                (kind == UnitKind::Special).then(|| watcher_failure(e))
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Watcher task aborted");
                (kind == UnitKind::Special).then(|| watcher_failure(e))
            }
        };

        if let Err(e) = tokio::spawn(finalize()).await {
            warn!(job_id = %job_id, error = %e, "Finalizer aborted");
        }

        debug!(job_id = %job_id, ?kind, "Unit terminated, notifying");
        broadcast(&queues, completion(kind, job_id, result));
    })
}

/// Kill requests for supervised subprocesses, keyed by job id.
///
/// A switch is armed while its unit runs and disarmed by the unit's
/// finalizer. Once a process has exited and been reaped nothing can signal
/// it any more.
#[derive(Debug, Clone, Default)]
pub struct KillSwitches {
    armed: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl KillSwitches {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm the switch of `job_id`. The receiver goes to [`wait_or_kill`].
    pub fn arm(&self, job_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(job_id.to_string(), tx);
        rx
    }

    /// Disarm the switch of a unit that has terminated.
    pub fn disarm(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Whether the unit of `job_id` is still running.
    pub fn is_armed(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    /// Ask the watcher of `job_id` to kill its process. False if it has
    /// already terminated.
    pub fn trigger(&self, job_id: &str) -> bool {
        match self.lock().remove(job_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Wait for `child` to exit, killing it first if `kill` fires.
pub async fn wait_or_kill(
    child: &mut Child,
    kill: oneshot::Receiver<()>,
) -> std::io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill => {
            debug!(pid = ?child.id(), "Killing process");
            child.start_kill()?;
            child.wait().await
        }
    }
}

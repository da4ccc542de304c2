// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WDL workflow execution.

use std::path::Path;
use std::process::Stdio;

use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::job::{JobError, RUNNER_ERROR_CODE};
use crate::logger::JobLogger;
use crate::runtime::logs::pump_output;
use crate::runtime::watcher::wait_or_kill;
use crate::runtime::{BindMount, Result, RuntimeError};

/// Metadata file the workflow engine writes into the shared directory.
pub const METADATA_FILE: &str = "meta.json";

/// `VOL_MOUNT_<n>` variables describing the job's volume mounts.
pub fn volume_env(mounts: &[BindMount]) -> Vec<(String, String)> {
    mounts
        .iter()
        .enumerate()
        .map(|(i, m)| (format!("VOL_MOUNT_{}", i), m.spec()))
        .collect()
}

/// Launch the workflow engine in `dir`.
///
/// `wdl_command` may carry leading arguments (`java -jar cromwell.jar`).
pub fn spawn(
    wdl_command: &str,
    dir: &Path,
    workflow: &str,
    inputs: &str,
    mounts: &[BindMount],
) -> Result<Child> {
    let mut parts = wdl_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| RuntimeError::StartFailed("empty workflow command".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(parts)
        .args(["run", workflow, "--inputs", inputs, "--metadata-output", METADATA_FILE])
        .envs(volume_env(mounts))
        .env_remove("KB_ADMIN_AUTH_TOKEN")
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
        .map_err(|e| RuntimeError::StartFailed(format!("{}: {}", program, e)))
}

/// Stream the engine's output into the job log and produce the workflow result.
///
/// The engine is killed if `kill` fires before it exits.
pub async fn watch_workflow(
    mut child: Child,
    logger: JobLogger,
    kill: oneshot::Receiver<()>,
) -> Result<Option<Value>> {
    let status = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => {
            let (pumped, status) =
                tokio::join!(pump_output(stdout, stderr, &logger), wait_or_kill(&mut child, kill));
            pumped?;
            status?
        }
        _ => wait_or_kill(&mut child, kill).await?,
    };
    let code = status.code().unwrap_or(-1);
    if status.success() {
        return Ok(Some(json!({ "result": [{ "exit_status": code }] })));
    }
    logger.error(format!("Workflow exited with status {}", code)).await;
    Ok(Some(
        JobError::new(
            RUNNER_ERROR_CODE,
            "Workflow failed",
            format!("Workflow engine exited with status {}", code),
        )
        .into_payload(),
    ))
}

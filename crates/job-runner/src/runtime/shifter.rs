// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shifter backend.
//!
//! Shifter has no daemon: each unit of work is a `shifter` launcher
//! subprocess whose stdout/stderr are streamed into the job log until the
//! process exits.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use super::logs::pump_output;
use super::watcher::{KillSwitches, UnitKind, supervise, wait_or_kill};
use super::{ContainerRuntime, Result, RunHandle, RuntimeError, RuntimeSettings, StartOptions};
use crate::logger::JobLogger;
use crate::message::MessageSender;

/// Entrypoint of KBase SDK module images.
const ENTRYPOINT: &str = "/kb/deployment/bin/entrypoint.sh";

/// Variables never passed through to the launcher.
const SCRUBBED_ENV: [&str; 1] = ["KB_ADMIN_AUTH_TOKEN"];

/// Shifter launcher backend.
#[derive(Debug, Clone)]
pub struct ShifterRuntime {
    settings: RuntimeSettings,
    launcher: String,
    image_tool: String,
    kill_switches: KillSwitches,
}

impl ShifterRuntime {
    /// Create a backend using `shifter` and `shifterimg` from PATH.
    pub fn new(settings: RuntimeSettings) -> Self {
        Self::with_binaries(settings, "shifter", "shifterimg")
    }

    /// Create a backend using specific launcher and image tool binaries.
    pub fn with_binaries(
        settings: RuntimeSettings,
        launcher: impl Into<String>,
        image_tool: impl Into<String>,
    ) -> Self {
        Self {
            settings,
            launcher: launcher.into(),
            image_tool: image_tool.into(),
            kill_switches: KillSwitches::default(),
        }
    }

    /// Whether the launcher of `job_id` is still running.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.kill_switches.is_armed(job_id)
    }
}

/// Arguments of the `shifter` launcher for a unit of work.
pub fn launch_args(options: &StartOptions) -> Vec<String> {
    let mut args = vec![format!("--image={}", options.image)];
    for mount in &options.mounts {
        args.push(format!("--volume={}", mount.spec()));
    }
    args.push(ENTRYPOINT.to_string());
    args.push("async".to_string());
    args
}

async fn lookup(image_tool: &str, image: &str) -> Result<Option<String>> {
    let output = Command::new(image_tool)
        .args(["lookup", image])
        .output()
        .await?;
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((output.status.success() && !id.is_empty()).then_some(id))
}

#[async_trait]
impl ContainerRuntime for ShifterRuntime {
    fn runtime_type(&self) -> &'static str {
        "shifter"
    }

    fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    async fn resolve_image(&self, image: &str) -> Result<Option<String>> {
        if let Some(id) = lookup(&self.image_tool, image).await? {
            return Ok(Some(id));
        }
        info!(image = %image, "Pulling image");
        let pull = Command::new(&self.image_tool)
            .args(["pull", image])
            .output()
            .await?;
        if !pull.status.success() {
            debug!(
                image = %image,
                stderr = %String::from_utf8_lossy(&pull.stderr).trim(),
                "shifterimg pull failed"
            );
        }
        lookup(&self.image_tool, image).await
    }

    async fn start(
        &self,
        options: StartOptions,
        logger: JobLogger,
        queues: Vec<MessageSender>,
    ) -> Result<RunHandle> {
        info!(job_id = %options.job_id, image = %options.image, "Starting shifter job");
        debug!(job_id = %options.job_id, labels = ?options.labels, "Labels are not applied by shifter");

        let mut cmd = Command::new(&self.launcher);
        cmd.args(launch_args(&options))
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for var in SCRUBBED_ENV {
            cmd.env_remove(var);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::StartFailed(format!("{}: {}", self.launcher, e)))?;
        let pid = child.id();

        let handle = RunHandle {
            handle_id: pid.map(|p| p.to_string()).unwrap_or_default(),
            job_id: options.job_id.clone(),
            runtime: self.runtime_type(),
            started_at: Utc::now(),
            pid,
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RuntimeError::StartFailed("shifter output not captured".to_string()));
        };

        let kill = self.kill_switches.arm(&options.job_id);
        let job_id = options.job_id.clone();
        let watch = async move {
            let (pumped, status) =
                tokio::join!(pump_output(stdout, stderr, &logger), wait_or_kill(&mut child, kill));
            pumped?;
            let status = status?;
            debug!(job_id = %job_id, ?status, "Shifter process exited");
            Ok::<_, RuntimeError>(None)
        };

        let switches = self.kill_switches.clone();
        let job_id = options.job_id.clone();
        let finalize = move || async move { switches.disarm(&job_id) };

        supervise(UnitKind::Container, options.job_id, queues, watch, finalize);
        Ok(handle)
    }

    async fn remove(&self, handle: &RunHandle) {
        if !self.kill_switches.trigger(&handle.job_id) {
            debug!(job_id = %handle.job_id, "Shifter process already gone");
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker backend.
//!
//! Drives the docker CLI. Containers run detached with the `async` entrypoint
//! argument; a watcher polls their state and ships timestamped logs until the
//! container exits, then removes it (unless debug mode is on).

use std::process::Output;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::logs::sort_lines_by_time;
use super::watcher::{UnitKind, supervise};
use super::{ContainerRuntime, Result, RunHandle, RuntimeError, RuntimeSettings, StartOptions};
use crate::logger::JobLogger;
use crate::message::MessageSender;

/// Container states in which the container is still considered alive.
const LIVE_STATES: [&str; 2] = ["created", "running"];

/// Docker CLI backend.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    settings: RuntimeSettings,
    binary: String,
}

impl DockerRuntime {
    /// Create a backend using the `docker` binary from PATH.
    pub fn new(settings: RuntimeSettings) -> Self {
        Self::with_binary(settings, "docker")
    }

    /// Create a backend using a specific docker-compatible binary.
    pub fn with_binary(settings: RuntimeSettings, binary: impl Into<String>) -> Self {
        Self {
            settings,
            binary: binary.into(),
        }
    }
}

/// Arguments of `docker run` for a unit of work.
///
/// Environment variables are passed by name only; their values are set on the
/// docker process so they never appear in a process listing.
pub fn run_args(options: &StartOptions) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--detach".to_string()];
    for (key, value) in &options.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for mount in &options.mounts {
        args.push("--volume".to_string());
        args.push(mount.spec());
    }
    for key in options.env.keys() {
        args.push("--env".to_string());
        args.push(key.clone());
    }
    if let Some(cgroup) = &options.cgroup {
        args.push("--cgroup-parent".to_string());
        args.push(cgroup.clone());
    }
    args.push(options.image.clone());
    args.push("async".to_string());
    args
}

async fn docker(binary: &str, args: &[&str]) -> Result<Output> {
    Ok(Command::new(binary).args(args).output().await?)
}

fn check(command: &str, output: Output) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(RuntimeError::Command {
            command: command.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Unix time with nanoseconds, as accepted by `docker logs --since/--until`.
fn docker_time(nanos: i64) -> String {
    format!("{}.{:09}", nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000))
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Ship the container's log lines written between `last` and now, then advance `last`.
async fn ship_logs(
    binary: &str,
    container_id: &str,
    last: &AtomicI64,
    logger: &JobLogger,
) -> Result<()> {
    let now = now_nanos();
    let since = docker_time(last.load(Ordering::SeqCst));
    let until = docker_time(now);
    let output = docker(
        binary,
        &["logs", "--timestamps", "--since", &since, "--until", &until, container_id],
    )
    .await?;
    if !output.status.success() {
        return Err(RuntimeError::Command {
            command: "docker logs".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    last.store(now, Ordering::SeqCst);
    let lines = sort_lines_by_time(
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
    );
    logger.log_lines(lines).await;
    Ok(())
}

async fn container_state(binary: &str, container_id: &str) -> Result<String> {
    let output = docker(binary, &["inspect", "--format", "{{.State.Status}}", container_id]).await?;
    check("docker inspect", output)
}

async fn remove_container(binary: &str, container_id: &str) {
    if let Err(e) = docker(binary, &["kill", container_id]).await {
        debug!(container_id = %container_id, error = %e, "docker kill failed");
    }
    match docker(binary, &["rm", "--force", container_id]).await {
        Ok(output) if output.status.success() => {
            debug!(container_id = %container_id, "Container removed")
        }
        Ok(_) | Err(_) => debug!(container_id = %container_id, "Container already gone"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    async fn resolve_image(&self, image: &str) -> Result<Option<String>> {
        let inspect = ["image", "inspect", "--format", "{{.Id}}", image];
        if let Ok(id) = check("docker image inspect", docker(&self.binary, &inspect).await?) {
            return Ok(Some(id));
        }

        info!(image = %image, "Pulling image");
        let pull = docker(&self.binary, &["pull", image]).await?;
        if let Err(e) = check("docker pull", pull) {
            warn!(image = %image, error = %e, "Image pull failed");
            return Ok(None);
        }
        Ok(check("docker image inspect", docker(&self.binary, &inspect).await?).ok())
    }

    async fn start(
        &self,
        options: StartOptions,
        logger: JobLogger,
        queues: Vec<MessageSender>,
    ) -> Result<RunHandle> {
        info!(job_id = %options.job_id, image = %options.image, "Starting container");
        let output = Command::new(&self.binary)
            .args(run_args(&options))
            .envs(&options.env)
            .output()
            .await?;
        let container_id = check("docker run", output)
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        let handle = RunHandle {
            handle_id: container_id.clone(),
            job_id: options.job_id.clone(),
            runtime: self.runtime_type(),
            started_at: Utc::now(),
            pid: None,
        };

        let started = handle.started_at.timestamp_nanos_opt().unwrap_or_default();
        let last = Arc::new(AtomicI64::new(started - 1_000_000_000));
        let interval = self.settings.log_interval;
        let debug_mode = self.settings.debug;

        let watch = {
            let binary = self.binary.clone();
            let container_id = container_id.clone();
            let logger = logger.clone();
            let last = last.clone();
            async move {
                let mut done = false;
                loop {
                    ship_logs(&binary, &container_id, &last, &logger).await?;
                    if done {
                        break;
                    }
                    tokio::time::sleep(interval).await;
                    done = match container_state(&binary, &container_id).await {
                        Ok(state) => !LIVE_STATES.contains(&state.as_str()),
                        Err(_) => true,
                    };
                }
                Ok::<_, RuntimeError>(None)
            }
        };

        let finalize = {
            let binary = self.binary.clone();
            let container_id = container_id.clone();
            move || async move {
                if let Err(e) = ship_logs(&binary, &container_id, &last, &logger).await {
                    debug!(container_id = %container_id, error = %e, "Final log flush failed");
                }
                if debug_mode {
                    logger
                        .log(format!(
                            "Not going to delete container {} because debug mode is on",
                            container_id
                        ))
                        .await;
                } else {
                    remove_container(&binary, &container_id).await;
                }
            }
        };

        supervise(UnitKind::Container, options.job_id, queues, watch, finalize);
        Ok(handle)
    }

    async fn remove(&self, handle: &RunHandle) {
        remove_container(&self.binary, &handle.handle_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCoordinator;
    use crate::message::{Message, queue};
    use crate::runtime::BindMount;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;

    /// A docker stand-in that records its arguments, reports the container
    /// running on the first inspect and exited afterwards, and prints its
    /// log lines once.
    fn fake_docker(dir: &Path, debug: bool) -> DockerRuntime {
        let d = dir.display();
        let body = format!(
            r#"#!/bin/sh
echo "$@" >> {d}/calls
case "$1" in
  image) echo sha256:feed ;;
  run) echo cid42 ;;
  inspect)
    n=$(cat {d}/inspected 2>/dev/null || echo 0)
    n=$((n + 1))
    echo $n > {d}/inspected
    if [ $n -ge 2 ]; then echo exited; else echo running; fi ;;
  logs)
    if [ ! -e {d}/logged ]; then
      touch {d}/logged
      echo "2024-05-01T10:00:01.000000000Z first"
      echo "2024-05-01T10:00:03.000000000Z third"
      echo "2024-05-01T10:00:02.000000000Z second" >&2
    fi ;;
esac
"#
        );
        let binary = dir.join("docker");
        std::fs::write(&binary, body).unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerRuntime::with_binary(
            RuntimeSettings {
                log_interval: Duration::from_millis(10),
                debug,
                ..Default::default()
            },
            binary.display().to_string(),
        )
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn run_to_exit(runtime: &DockerRuntime) -> (RunHandle, Arc<MockCoordinator>) {
        let coordinator = Arc::new(MockCoordinator::new());
        let (tx, mut rx) = queue();
        let options = StartOptions {
            job_id: "1234".to_string(),
            image: "mock_app:latest".to_string(),
            ..Default::default()
        };

        let handle = runtime
            .start(options, JobLogger::new("1234", coordinator.clone()), vec![tx])
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap();
        assert!(matches!(
            message,
            Some(Message::Finished { ref job_id, output: None }) if job_id == "1234"
        ));
        assert!(rx.try_recv().is_err());
        (handle, coordinator)
    }

    #[tokio::test]
    async fn test_container_watched_until_exit_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(dir.path(), false);

        assert_eq!(runtime.ensure_image("mock_app:latest").await.unwrap(), "sha256:feed");
        let (handle, coordinator) = run_to_exit(&runtime).await;
        assert_eq!(handle.handle_id, "cid42");

        let calls = calls(dir.path());
        assert!(calls.iter().any(|c| c.starts_with("run --detach") && c.ends_with("mock_app:latest async")));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("inspect")).count(),
            2,
            "polled until the container exited"
        );
        assert!(calls.iter().any(|c| c == "kill cid42"));
        assert_eq!(calls.last().map(String::as_str), Some("rm --force cid42"));

        let shipped: Vec<_> = coordinator
            .logs()
            .into_iter()
            .filter(|l| l.ts.is_some())
            .map(|l| (l.line, l.is_error))
            .collect();
        assert_eq!(
            shipped,
            [
                ("first".to_string(), false),
                ("second".to_string(), true),
                ("third".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_debug_mode_keeps_container() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_docker(dir.path(), true);

        let (_, coordinator) = run_to_exit(&runtime).await;

        let calls = calls(dir.path());
        assert!(calls.iter().any(|c| c.starts_with("logs")));
        assert!(!calls.iter().any(|c| c.starts_with("rm") || c.starts_with("kill")));
        assert!(
            coordinator
                .logs()
                .iter()
                .any(|l| l.line.contains("Not going to delete container cid42"))
        );
    }

    #[test]
    fn test_run_args() {
        let mut options = StartOptions {
            job_id: "1234".to_string(),
            image: "mock_app:latest".to_string(),
            mounts: vec![BindMount::new("/mnt/job/workdir", "/kb/module/work", false)],
            cgroup: Some("htcondor/slot1".to_string()),
            ..Default::default()
        };
        options.env.insert("SDK_CALLBACK_URL".to_string(), "http://10.0.0.1:9999/".to_string());
        options.labels.insert("job_id".to_string(), "1234".to_string());

        let args = run_args(&options);
        assert_eq!(
            args,
            [
                "run",
                "--detach",
                "--label",
                "job_id=1234",
                "--volume",
                "/mnt/job/workdir:/kb/module/work:rw",
                "--env",
                "SDK_CALLBACK_URL",
                "--cgroup-parent",
                "htcondor/slot1",
                "mock_app:latest",
                "async",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("10.0.0.1")));
    }

    #[test]
    fn test_docker_time() {
        assert_eq!(docker_time(1_700_000_000_000_000_001), "1700000000.000000001");
        assert_eq!(docker_time(0), "0.000000000");
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let runtime = DockerRuntime::with_binary(RuntimeSettings::default(), "/nonexistent/docker");
        assert!(matches!(
            runtime.resolve_image("mock_app:latest").await,
            Err(RuntimeError::Io(_))
        ));
    }
}

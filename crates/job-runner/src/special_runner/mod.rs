// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Non-container ("special") methods.
//!
//! Methods in the `special` namespace run through a batch system
//! (`special.slurm`) or a workflow engine (`special.wdl`) instead of a method
//! container. Completion is announced with a `finished_special` message that
//! carries the result.

pub mod batch;
pub mod wdl;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::clients::VolumeMount;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{JobParams, SPECIAL_MODULE};
use crate::logger::JobLogger;
use crate::message::MessageSender;
use crate::method_runner::{JobContext, shared_dir};
use crate::runtime::watcher::{KillSwitches, UnitKind, supervise};
use crate::runtime::{BindMount, RunHandle};

use batch::{BatchCommands, watch_batch};

/// Allowed special method types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    /// Slurm batch submission.
    Slurm,
    /// WDL workflow.
    Wdl,
}

impl SpecialKind {
    /// Method name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slurm => "slurm",
            Self::Wdl => "wdl",
        }
    }
}

impl FromStr for SpecialKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slurm" => Ok(Self::Slurm),
            "wdl" => Ok(Self::Wdl),
            other => Err(Error::InvalidSpecial(format!(
                "Invalid special method type: {}",
                other
            ))),
        }
    }
}

fn first_param(params: &Value) -> &Value {
    match params {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidSpecial(format!("Missing {}", key.replace('_', " "))))
}

/// Launches and supervises special methods.
pub struct SpecialRunner {
    shared_dir: PathBuf,
    bin_dir: Option<PathBuf>,
    wdl_command: String,
    poll: Duration,
    logger: JobLogger,
    queue: MessageSender,
    handles: Vec<RunHandle>,
    kill_switches: KillSwitches,
}

impl SpecialRunner {
    /// Create a runner for the job in `config`. Completions go to `queue`.
    pub fn new(config: &Config, logger: JobLogger, queue: MessageSender) -> Self {
        Self {
            shared_dir: shared_dir(&config.workdir),
            bin_dir: config.batch_bin_dir.clone(),
            wdl_command: config.wdl_command.clone(),
            poll: config.timing.batch_poll_interval,
            logger,
            queue,
            handles: Vec::new(),
            kill_switches: KillSwitches::default(),
        }
    }

    /// Handles of the units started by this runner that have not finished.
    pub fn handles(&self) -> &[RunHandle] {
        &self.handles
    }

    /// Forget a unit that has finished, so teardown leaves it alone.
    pub fn release(&mut self, job_id: &str) {
        self.handles.retain(|h| h.job_id != job_id);
    }

    /// Validate and start a special method.
    pub async fn run(
        &mut self,
        ctx: &JobContext,
        params: &JobParams,
        job_id: &str,
        volume_mounts: Option<&[VolumeMount]>,
    ) -> Result<RunHandle> {
        let method = params.method_ref()?;
        if method.module != SPECIAL_MODULE {
            return Err(Error::InvalidSpecial(
                "Attempting to run the wrong type of module. The module should be 'special'"
                    .to_string(),
            ));
        }
        let kind: SpecialKind = method.method.parse()?;
        self.logger
            .log(format!("Submit {} as a {}:{} job", job_id, method.module, method.method))
            .await;

        tokio::fs::create_dir_all(&self.shared_dir).await?;
        let args = first_param(&params.params);

        let handle = match kind {
            SpecialKind::Slurm => self.submit_batch(kind, args, job_id).await?,
            SpecialKind::Wdl => {
                let mounts: Vec<BindMount> = volume_mounts
                    .unwrap_or_default()
                    .iter()
                    .map(|m| {
                        BindMount::new(
                            m.resolve_host_dir(&ctx.user),
                            m.container_dir.clone(),
                            m.read_only,
                        )
                    })
                    .collect();
                self.run_workflow(args, job_id, &mounts)?
            }
        };
        info!(
            job_id = %job_id,
            kind = kind.as_str(),
            handle = %handle.handle_id,
            "Special job started"
        );
        self.handles.push(handle.clone());
        Ok(handle)
    }

    async fn submit_batch(
        &self,
        kind: SpecialKind,
        args: &Value,
        job_id: &str,
    ) -> Result<RunHandle> {
        let script = required_str(args, "submit_script")?;
        if !self.shared_dir.join(script).exists() {
            return Err(Error::InvalidSpecial(format!(
                "Submit script not found at {}",
                script
            )));
        }
        let outfile = format!("{}.out", job_id);
        let errfile = format!("{}.err", job_id);

        let commands = BatchCommands::new(self.bin_dir.clone(), kind.as_str());
        let batch_id = commands
            .submit(&self.shared_dir, script, &outfile, &errfile)
            .await?;

        let handle = RunHandle {
            handle_id: batch_id.clone(),
            job_id: job_id.to_string(),
            runtime: kind.as_str(),
            started_at: chrono::Utc::now(),
            pid: None,
        };
        supervise(
            UnitKind::Special,
            job_id.to_string(),
            vec![self.queue.clone()],
            watch_batch(
                commands,
                batch_id,
                self.shared_dir.join(outfile),
                self.shared_dir.join(errfile),
                self.poll,
                self.logger.clone(),
            ),
            || async {},
        );
        Ok(handle)
    }

    fn run_workflow(
        &self,
        args: &Value,
        job_id: &str,
        mounts: &[BindMount],
    ) -> Result<RunHandle> {
        let workflow = required_str(args, "workflow")?;
        let inputs = required_str(args, "inputs")?;

        let child = wdl::spawn(&self.wdl_command, &self.shared_dir, workflow, inputs, mounts)?;
        let pid = child.id();
        let kill = self.kill_switches.arm(job_id);
        let switches = self.kill_switches.clone();
        let unit = job_id.to_string();
        let handle = RunHandle {
            handle_id: pid.map(|p| p.to_string()).unwrap_or_default(),
            job_id: job_id.to_string(),
            runtime: SpecialKind::Wdl.as_str(),
            started_at: chrono::Utc::now(),
            pid,
        };
        supervise(
            UnitKind::Special,
            job_id.to_string(),
            vec![self.queue.clone()],
            wdl::watch_workflow(child, self.logger.clone(), kill),
            move || async move { switches.disarm(&unit) },
        );
        Ok(handle)
    }

    /// Cancel every batch job and kill every workflow engine this runner started.
    pub async fn cleanup_all(&mut self, debug: bool) {
        if debug {
            for handle in &self.handles {
                info!(
                    job_id = %handle.job_id,
                    handle = %handle.handle_id,
                    "Debug mode, not cancelling"
                );
            }
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.runtime == SpecialKind::Wdl.as_str() {
                if !self.kill_switches.trigger(&handle.job_id) {
                    debug!(job_id = %handle.job_id, "Workflow engine already gone");
                }
            } else {
                BatchCommands::new(self.bin_dir.clone(), handle.runtime)
                    .cancel(&handle.handle_id)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCoordinator;
    use crate::logger::LogLine;
    use crate::message::{Message, MessageReceiver, queue};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        coordinator: Arc<MockCoordinator>,
        runner: SpecialRunner,
        rx: MessageReceiver,
    }

    fn script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();

        let mut config = Config::new("123", "https://ci.kbase.us/services/ee2", "tok");
        config.workdir = dir.path().to_path_buf();
        config.batch_bin_dir = Some(bin);
        config.wdl_command = dir.path().join("bin/fake_wdl").display().to_string();
        config.timing.batch_poll_interval = Duration::from_millis(20);

        let coordinator = Arc::new(MockCoordinator::new());
        let (tx, rx) = queue();
        let runner = SpecialRunner::new(&config, JobLogger::new("123", coordinator.clone()), tx);
        Fixture {
            dir,
            coordinator,
            runner,
            rx,
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            user: "bogus".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_unknown_types() {
        let mut f = fixture();
        for method in ["special.cwl", "mock_app.slurm"] {
            let params = JobParams::new(method, json!([{}]));
            assert!(matches!(
                f.runner.run(&ctx(), &params, "1234", None).await,
                Err(Error::InvalidSpecial(_))
            ));
        }
        let params = JobParams::new("special.slurm", json!([{}]));
        assert!(matches!(
            f.runner.run(&ctx(), &params, "1234", None).await,
            Err(Error::InvalidSpecial(ref m)) if m == "Missing submit script"
        ));
    }

    #[tokio::test]
    async fn test_slurm_job_streams_files() {
        let mut f = fixture();
        let bin = f.dir.path().join("bin");
        script(
            &bin.join("slurm_submit"),
            "echo line1 > \"$2\"\necho line3 >> \"$2\"\necho line2 > \"$3\"\necho 42",
        );
        script(&bin.join("slurm_checkjob"), "echo Finished");
        std::fs::create_dir_all(shared_dir(f.dir.path())).unwrap();
        std::fs::write(shared_dir(f.dir.path()).join("submit.sl"), "#!/bin/sh\necho Hello\n").unwrap();

        let params = JobParams::new("special.slurm", json!([{"submit_script": "submit.sl"}]));
        let handle = f.runner.run(&ctx(), &params, "1234", None).await.unwrap();
        assert_eq!(handle.handle_id, "42");
        assert_eq!(handle.runtime, "slurm");

        match tokio::time::timeout(Duration::from_secs(10), f.rx.recv()).await.unwrap() {
            Some(Message::FinishedSpecial { job_id, result }) => {
                assert_eq!(job_id, "1234");
                assert_eq!(result, json!({"result": [{"exit_status": 0}]}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        let logs = f.coordinator.logs();
        assert!(logs.contains(&LogLine::stdout("line1")));
        assert!(logs.contains(&LogLine::stderr("line2")));
        assert!(logs.contains(&LogLine::stdout("line3")));
    }

    #[tokio::test]
    async fn test_wdl_exports_volume_mounts() {
        let mut f = fixture();
        script(
            &f.dir.path().join("bin/fake_wdl"),
            "echo \"$VOL_MOUNT_0\"\necho \"workflow finished with status 'Succeeded'\" >&2\necho '{\"outputs\": {}}' > \"$6\"",
        );
        let params = JobParams::new(
            "special.wdl",
            json!([{"workflow": "workflow.wdl", "inputs": "inputs.json"}]),
        );
        let mounts = vec![VolumeMount {
            host_dir: "/tmp/data".to_string(),
            container_dir: "/data".to_string(),
            read_only: true,
        }];

        let handle = f
            .runner
            .run(&ctx(), &params, "1234", Some(&mounts))
            .await
            .unwrap();
        assert!(handle.pid.is_some());

        match tokio::time::timeout(Duration::from_secs(10), f.rx.recv()).await.unwrap() {
            Some(Message::FinishedSpecial { result, .. }) => {
                assert_eq!(result["result"][0]["exit_status"], 0);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        let logs = f.coordinator.logs();
        assert!(logs.contains(&LogLine::stdout("/tmp/data:/data:ro")));
        assert!(logs.iter().any(|l| l.is_error && l.line.contains("Succeeded")));
        assert!(shared_dir(f.dir.path()).join(wdl::METADATA_FILE).exists());
    }

    #[tokio::test]
    async fn test_finished_workflow_is_released() {
        let mut f = fixture();
        script(&f.dir.path().join("bin/fake_wdl"), "exit 0");
        let params = JobParams::new(
            "special.wdl",
            json!([{"workflow": "workflow.wdl", "inputs": "inputs.json"}]),
        );

        f.runner.run(&ctx(), &params, "1234", None).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(10), f.rx.recv()).await.unwrap() {
            Some(Message::FinishedSpecial { job_id, .. }) => f.runner.release(&job_id),
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(f.runner.handles().is_empty());
        assert!(!f.runner.kill_switches.is_armed("1234"));
        f.runner.cleanup_all(false).await;
    }

    #[tokio::test]
    async fn test_cleanup_kills_running_workflow() {
        let mut f = fixture();
        script(&f.dir.path().join("bin/fake_wdl"), "echo started\nexec sleep 30");
        let params = JobParams::new(
            "special.wdl",
            json!([{"workflow": "workflow.wdl", "inputs": "inputs.json"}]),
        );

        f.runner.run(&ctx(), &params, "1234", None).await.unwrap();
        f.runner.cleanup_all(false).await;

        match tokio::time::timeout(Duration::from_secs(10), f.rx.recv()).await.unwrap() {
            Some(Message::FinishedSpecial { result, .. }) => {
                assert_eq!(result["error"]["name"], "Workflow failed");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(f.runner.handles().is_empty());
        assert!(!f.runner.kill_switches.is_armed("1234"));
    }

    #[tokio::test]
    async fn test_cleanup_cancels_batch_jobs() {
        let mut f = fixture();
        let bin = f.dir.path().join("bin");
        let cancelled = f.dir.path().join("cancelled");
        script(&bin.join("slurm_submit"), "echo 77");
        script(&bin.join("slurm_checkjob"), "echo Pending");
        script(
            &bin.join("slurm_cancel"),
            &format!("echo \"$1\" > {}", cancelled.display()),
        );
        std::fs::create_dir_all(shared_dir(f.dir.path())).unwrap();
        std::fs::write(shared_dir(f.dir.path()).join("submit.sl"), "").unwrap();

        let params = JobParams::new("special.slurm", json!([{"submit_script": "submit.sl"}]));
        f.runner.run(&ctx(), &params, "1234", None).await.unwrap();
        f.runner.cleanup_all(false).await;

        assert_eq!(std::fs::read_to_string(&cancelled).unwrap().trim(), "77");
        assert!(f.runner.handles().is_empty());
    }
}

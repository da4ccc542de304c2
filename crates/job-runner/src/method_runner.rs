// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container method invocations.
//!
//! # Workspace layout
//!
//! ```text
//! <workdir>/
//! ├── workdir/                 top-level job, mounted at /kb/module/work
//! │   ├── config.properties
//! │   ├── input.json
//! │   ├── token
//! │   ├── tmp/                 shared scratch, also mounted into subjobs
//! │   └── output.json          written by the container
//! └── subjobs/<job id>/        same layout per subjob
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::clients::{ModuleInfo, ServerConfig, VolumeMount};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::{JobError, JobParams, output_error};
use crate::logger::JobLogger;
use crate::message::MessageSender;
use crate::provenance::Action;
use crate::runtime::{BindMount, ContainerRuntime, RunHandle, StartOptions};

/// Job directory mount point inside method containers.
pub const CONTAINER_WORK_DIR: &str = "/kb/module/work";

/// Shared scratch mount point inside subjob containers.
pub const CONTAINER_SHARED_DIR: &str = "/kb/module/work/tmp";

/// Reference data mount point inside method containers.
pub const CONTAINER_REFDATA_DIR: &str = "/data";

/// Prefix of secure configuration parameter environment variables.
pub const SECURE_PARAM_PREFIX: &str = "KBASE_SECURE_CONFIG_PARAM_";

/// `config.properties` keys and the server configuration keys they are read from.
const ENDPOINT_KEYS: &[(&str, &[&str])] = &[
    ("kbase_endpoint", &["kbase-endpoint", "kbase.endpoint"]),
    ("workspace_url", &["workspace-url", "workspace.srv.url"]),
    ("external_url", &["external-url", "self.external.url"]),
    ("shock_url", &["shock-url", "shock.url"]),
    ("handle_url", &["handle-url", "handle.url"]),
    ("srv_wiz_url", &["srv-wiz-url", "srv.wiz.url"]),
    ("auth_service_url", &["auth-service-url", "auth.service.url"]),
    ("auth_service_url_v2", &["auth-service-url-v2", "auth.service.url.v2"]),
    (
        "auth_service_url_allow_insecure",
        &["auth-service-url-allow-insecure", "auth.service.url.allow.insecure"],
    ),
    ("scratch", &["scratch"]),
];

/// Directory of the top-level job.
pub fn job_dir(workdir: &Path) -> PathBuf {
    workdir.join("workdir")
}

/// Scratch directory shared between the top-level job and its subjobs.
pub fn shared_dir(workdir: &Path) -> PathBuf {
    job_dir(workdir).join("tmp")
}

/// Directory of a subjob.
pub fn subjob_dir(workdir: &Path, job_id: &str) -> PathBuf {
    workdir.join("subjobs").join(job_id)
}

/// Per-job facts established during initialisation.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    /// User the token belongs to.
    pub user: String,
    /// URL containers use to reach the callback gateway.
    pub callback_url: String,
    /// Server-wide configuration from the coordinator.
    pub server_config: ServerConfig,
    /// Parent cgroup for containers.
    pub cgroup: Option<String>,
}

/// Render `config.properties` from the server configuration.
pub fn render_config_properties(config: &ServerConfig) -> String {
    let mut out = String::from("[global]\n");
    for (key, aliases) in ENDPOINT_KEYS {
        out.push_str(&format!("{} = {}\n", key, config.first(aliases).unwrap_or_default()));
    }
    out
}

/// Build `input.json` for a method call.
pub fn input_document(job_id: &str, params: &JobParams) -> Value {
    json!({
        "id": job_id,
        "version": "1.1",
        "method": params.method,
        "params": params.params,
        "context": {
            "call_stack": [{
                "method": params.method,
                "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
            }],
            "service_ver": params.service_ver,
        },
    })
}

/// Resolve configured volume mounts, checking every host directory exists.
pub fn resolve_mounts(mounts: &[VolumeMount], user: &str) -> Result<Vec<BindMount>> {
    mounts
        .iter()
        .map(|m| {
            let host = m.resolve_host_dir(user);
            if !Path::new(&host).exists() {
                return Err(Error::MissingVolumeMount(host));
            }
            Ok(BindMount::new(host, m.container_dir.clone(), m.read_only))
        })
        .collect()
}

/// Launches container methods and reads their results.
pub struct MethodRunner {
    job_id: String,
    token: String,
    workdir: PathBuf,
    refdata_dir: PathBuf,
    ee2_url: String,
    hostname: String,
    runtime: Arc<dyn ContainerRuntime>,
    logger: JobLogger,
    queue: MessageSender,
    handles: Vec<RunHandle>,
}

impl MethodRunner {
    /// Create a runner for the job in `config`. Completions go to `queue`.
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        logger: JobLogger,
        queue: MessageSender,
    ) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            job_id: config.job_id.clone(),
            token: config.token.clone(),
            workdir: config.workdir.clone(),
            refdata_dir: config.refdata_dir.clone(),
            ee2_url: config.ee2_url.clone(),
            hostname,
            runtime,
            logger,
            queue,
            handles: Vec::new(),
        }
    }

    fn dir_for(&self, job_id: &str, subjob: bool) -> PathBuf {
        if subjob {
            subjob_dir(&self.workdir, job_id)
        } else {
            job_dir(&self.workdir)
        }
    }

    /// Handles of every unit started by this runner.
    pub fn handles(&self) -> &[RunHandle] {
        &self.handles
    }

    async fn init_workdir(
        &self,
        dir: &Path,
        job_id: &str,
        ctx: &JobContext,
        params: &JobParams,
    ) -> Result<()> {
        tokio::fs::write(
            dir.join("config.properties"),
            render_config_properties(&ctx.server_config),
        )
        .await?;
        tokio::fs::write(
            dir.join("input.json"),
            serde_json::to_vec(&input_document(job_id, params))?,
        )
        .await?;

        let mut token = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(dir.join("token"))
            .await?;
        token.write_all(self.token.as_bytes()).await?;
        token.flush().await?;

        tokio::fs::create_dir_all(dir.join("tmp")).await?;
        Ok(())
    }

    fn labels(
        &self,
        ctx: &JobContext,
        info: &ModuleInfo,
        params: &JobParams,
        job_id: &str,
        subjob: bool,
    ) -> Result<BTreeMap<String, String>> {
        let method = params.method_ref()?;
        let parent = if subjob {
            self.job_id.clone()
        } else {
            params.parent_job_id.clone().unwrap_or_default()
        };
        let mut labels = BTreeMap::from([
            (
                "app_id".to_string(),
                params
                    .app_id
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}", method.module, method.method)),
            ),
            ("app_name".to_string(), method.method.clone()),
            ("image_name".to_string(), info.image.clone()),
            (
                "image_version".to_string(),
                info.image.rsplit('.').next().unwrap_or_default().to_string(),
            ),
            ("job_id".to_string(), job_id.to_string()),
            ("parent_job_id".to_string(), parent),
            ("user_name".to_string(), ctx.user.clone()),
            (
                "wsid".to_string(),
                params.wsid.map(|w| w.to_string()).unwrap_or_default(),
            ),
            ("hostname".to_string(), self.hostname.clone()),
            ("ee2_endpoint".to_string(), self.ee2_url.clone()),
        ]);
        if let Ok(condor_id) = std::env::var("CONDOR_ID") {
            labels.insert("condor_id".to_string(), condor_id);
        }
        Ok(labels)
    }

    /// Prepare the workspace and start the method container.
    ///
    /// Returns once the container is running; completion arrives later as a
    /// `finished` message on the runner's queue.
    pub async fn run(
        &mut self,
        ctx: &JobContext,
        module_info: &ModuleInfo,
        volume_mounts: Option<&[VolumeMount]>,
        params: &JobParams,
        job_id: &str,
        subjob: bool,
    ) -> Result<Action> {
        let method = params.method_ref()?;
        let dir = self.dir_for(job_id, subjob);
        tokio::fs::create_dir_all(&dir).await?;

        let image = &module_info.image;
        let image_id = self.runtime.ensure_image(image).await?;
        debug!(image = %image, image_id = %image_id, "Image resolved");

        if subjob {
            self.logger
                .log(format!("Subjob method: {} JobID: {}", params.method, job_id))
                .await;
        }
        self.logger
            .log(format!("Running docker container for image: {}", image))
            .await;

        self.init_workdir(&dir, job_id, ctx, params).await?;

        let mut mounts = vec![BindMount::new(&dir, CONTAINER_WORK_DIR, false)];
        if subjob {
            mounts.push(BindMount::new(
                shared_dir(&self.workdir),
                CONTAINER_SHARED_DIR,
                false,
            ));
        }
        if let Some(volume_mounts) = volume_mounts {
            match resolve_mounts(volume_mounts, &ctx.user) {
                Ok(resolved) => mounts.extend(resolved),
                Err(e) => {
                    self.logger.error(e.to_string()).await;
                    return Err(e);
                }
            }
        }
        if let Some(refdata) = module_info.refdata_path() {
            mounts.push(BindMount::new(
                self.refdata_dir.join(refdata),
                CONTAINER_REFDATA_DIR,
                true,
            ));
        }

        let mut env =
            BTreeMap::from([("SDK_CALLBACK_URL".to_string(), ctx.callback_url.clone())]);
        for p in &module_info.secure_config_params {
            env.insert(
                format!("{}{}", SECURE_PARAM_PREFIX, p.param_name),
                p.param_value.clone(),
            );
        }

        let options = StartOptions {
            job_id: job_id.to_string(),
            image: image.clone(),
            env,
            mounts,
            labels: self.labels(ctx, module_info, params, job_id, subjob)?,
            cgroup: ctx.cgroup.clone(),
        };

        let handle = self
            .runtime
            .start(options, self.logger.clone(), vec![self.queue.clone()])
            .await?;
        info!(job_id = %job_id, handle = %handle.handle_id, "Method container started");
        self.handles.push(handle);

        Ok(Action {
            name: method.module,
            ver: module_info
                .version
                .clone()
                .or_else(|| params.service_ver.clone())
                .unwrap_or_default(),
            code_url: module_info.git_url.clone(),
            commit: module_info.git_commit_hash.clone(),
        })
    }

    /// Read and validate the result a method left in its workspace.
    pub async fn get_output(&self, job_id: &str, subjob: bool, max_size: u64) -> Value {
        let path = self.dir_for(job_id, subjob).join("output.json");
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                self.logger.error("No output").await;
                return JobError::output_not_found().into_payload();
            }
        };
        if size > max_size {
            self.logger
                .error(format!("Method returned too much output ({} > {})", size, max_size))
                .await;
            return JobError::too_much_output(size, max_size).into_payload();
        }

        let output: Value = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(output) => output,
                Err(e) => return JobError::malformed_output(e).into_payload(),
            },
            Err(e) => return JobError::malformed_output(e).into_payload(),
        };

        if output_error(&output).is_some() {
            self.logger.error("Error in job").await;
        }
        output
    }

    /// Forget a unit that has finished. Its backend already cleaned it up.
    pub fn release(&mut self, job_id: &str) {
        self.handles.retain(|h| h.job_id != job_id);
    }

    /// Remove every unit this runner started. In debug mode only log them.
    pub async fn cleanup_all(&mut self, debug: bool) {
        if debug {
            for handle in &self.handles {
                info!(
                    job_id = %handle.job_id,
                    handle = %handle.handle_id,
                    "Debug mode, not removing"
                );
            }
            return;
        }
        for handle in self.handles.drain(..) {
            self.runtime.remove(&handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SecureConfigParam;
    use crate::clients::mock::{MockCoordinator, module_info};
    use crate::message::{Message, MessageReceiver, queue};
    use crate::runtime::{MockBehavior, MockRuntime, RuntimeSettings};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        runtime: Arc<MockRuntime>,
        runner: MethodRunner,
        rx: MessageReceiver,
    }

    fn fixture(behavior: MockBehavior) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("1234", "https://ci.kbase.us/services/ee2", "tok");
        config.workdir = dir.path().to_path_buf();
        config.refdata_dir = PathBuf::from("/refdata");
        let runtime =
            Arc::new(MockRuntime::new(RuntimeSettings::default()).with_behavior(behavior));
        let (tx, rx) = queue();
        let logger = JobLogger::new("1234", Arc::new(MockCoordinator::new()));
        let runner = MethodRunner::new(&config, runtime.clone(), logger, tx);
        Fixture {
            dir,
            runtime,
            runner,
            rx,
        }
    }

    fn ctx() -> JobContext {
        JobContext {
            user: "bogus".to_string(),
            callback_url: "http://127.0.0.1:9999/".to_string(),
            server_config: [("kbase-endpoint", "https://ci.kbase.us/services")]
                .into_iter()
                .collect(),
            cgroup: None,
        }
    }

    #[tokio::test]
    async fn test_run_prepares_workspace() {
        let mut f = fixture(MockBehavior::default());
        let mut info = module_info("mock_app", "kbase/mock_app.1a2b3c");
        info.data_folder = Some("mock_app".to_string());
        info.data_version = Some("1.0".to_string());
        info.secure_config_params = vec![SecureConfigParam {
            param_name: "api_key".to_string(),
            param_value: "s3cr3t".to_string(),
        }];
        let params = JobParams::new("mock_app.bogus", json!([{"a": 1}]));

        let action = f
            .runner
            .run(&ctx(), &info, None, &params, "1234", false)
            .await
            .unwrap();
        assert_eq!(action.name, "mock_app");
        assert_eq!(action.ver, "0.0.1");
        assert_eq!(action.code_url, info.git_url);

        let dir = job_dir(f.dir.path());
        let input: Value =
            serde_json::from_slice(&std::fs::read(dir.join("input.json")).unwrap()).unwrap();
        assert_eq!(input["id"], "1234");
        assert_eq!(input["version"], "1.1");
        assert_eq!(input["params"], json!([{"a": 1}]));
        assert_eq!(input["context"]["call_stack"][0]["method"], "mock_app.bogus");
        let props = std::fs::read_to_string(dir.join("config.properties")).unwrap();
        assert!(props.starts_with("[global]\n"));
        assert!(props.contains("kbase_endpoint = https://ci.kbase.us/services\n"));
        let token = dir.join("token");
        assert_eq!(std::fs::read_to_string(&token).unwrap(), "tok");
        assert_eq!(
            std::fs::metadata(&token).unwrap().permissions().mode() & 0o777,
            0o600
        );
        assert!(dir.join("tmp").is_dir());

        let started = &f.runtime.started()[0];
        assert_eq!(started.env["SDK_CALLBACK_URL"], "http://127.0.0.1:9999/");
        assert_eq!(started.env["KBASE_SECURE_CONFIG_PARAM_api_key"], "s3cr3t");
        assert_eq!(started.labels["app_id"], "mock_app/bogus");
        assert_eq!(started.labels["app_name"], "bogus");
        assert_eq!(started.labels["image_version"], "1a2b3c");
        assert_eq!(started.labels["user_name"], "bogus");
        assert_eq!(started.labels["parent_job_id"], "");
        assert_eq!(started.mount_for(CONTAINER_WORK_DIR).unwrap().host, dir);
        assert_eq!(
            started.mount_for(CONTAINER_REFDATA_DIR).unwrap().host,
            PathBuf::from("/refdata/mock_app/1.0")
        );
        assert!(started.mount_for(CONTAINER_SHARED_DIR).is_none());
        assert!(!started.env.values().any(|v| v == "tok"));

        assert!(matches!(f.rx.recv().await, Some(Message::Finished { .. })));
        let output = f.runner.get_output("1234", false, 1024).await;
        assert_eq!(output, json!({"result": ["ok"]}));
    }

    #[tokio::test]
    async fn test_subjob_gets_own_dir_and_shared_tmp() {
        let mut f = fixture(MockBehavior::default());
        let info = module_info("echo_test", "echo_test:latest");
        let params = JobParams::new("echo_test.echo", json!([]));

        f.runner
            .run(&ctx(), &info, None, &params, "sub-1", true)
            .await
            .unwrap();

        let started = &f.runtime.started()[0];
        assert_eq!(
            started.mount_for(CONTAINER_WORK_DIR).unwrap().host,
            subjob_dir(f.dir.path(), "sub-1")
        );
        let shared = started.mount_for(CONTAINER_SHARED_DIR).unwrap();
        assert_eq!(shared.host, shared_dir(f.dir.path()));
        assert!(!shared.read_only);
        assert_eq!(started.labels["parent_job_id"], "1234");

        assert!(matches!(f.rx.recv().await, Some(Message::Finished { .. })));
        assert_eq!(
            f.runner.get_output("sub-1", true, 1024).await,
            json!({"result": ["ok"]})
        );
    }

    #[tokio::test]
    async fn test_missing_volume_mount_is_fatal() {
        let mut f = fixture(MockBehavior::default());
        let info = module_info("mock_app", "mock_app:latest");
        let params = JobParams::new("mock_app.bogus", json!([]));
        let mounts = vec![VolumeMount {
            host_dir: "/nonexistent/${username}".to_string(),
            container_dir: "/staging".to_string(),
            read_only: true,
        }];

        let err = f
            .runner
            .run(&ctx(), &info, Some(&mounts), &params, "1234", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingVolumeMount(ref p) if p == "/nonexistent/bogus"));
        assert!(f.runtime.started().is_empty());
    }

    #[test]
    fn test_resolve_mounts_substitutes_user() {
        let host = tempfile::tempdir().unwrap();
        let user_dir = host.path().join("bogus");
        std::fs::create_dir(&user_dir).unwrap();
        let mounts = vec![VolumeMount {
            host_dir: format!("{}/${{username}}", host.path().display()),
            container_dir: "/staging".to_string(),
            read_only: false,
        }];

        let resolved = resolve_mounts(&mounts, "bogus").unwrap();
        assert_eq!(resolved, vec![BindMount::new(user_dir, "/staging", false)]);
    }

    #[tokio::test]
    async fn test_get_output_errors() {
        let f = fixture(MockBehavior::default());
        let dir = job_dir(f.dir.path());
        std::fs::create_dir_all(&dir).unwrap();

        let missing = f.runner.get_output("1234", false, 1024).await;
        assert_eq!(missing["error"]["name"], "Output not found");

        std::fs::write(dir.join("output.json"), vec![b' '; 2048]).unwrap();
        let big = f.runner.get_output("1234", false, 1024).await;
        assert_eq!(big["error"]["name"], "Too much output from a method");
        assert_eq!(big["error"]["code"], -32601);

        std::fs::write(dir.join("output.json"), "{not json").unwrap();
        let bad = f.runner.get_output("1234", false, 1024).await;
        assert_eq!(bad["error"]["name"], "Malformed output");

        let app_error = json!({"error": {"name": "ValueError", "message": "bad input"}});
        std::fs::write(dir.join("output.json"), app_error.to_string()).unwrap();
        assert_eq!(f.runner.get_output("1234", false, 1024).await, app_error);
    }

    #[tokio::test]
    async fn test_cleanup_all_respects_debug() {
        let mut f = fixture(MockBehavior::Manual);
        let info = module_info("mock_app", "mock_app:latest");
        let params = JobParams::new("mock_app.bogus", json!([]));
        f.runner
            .run(&ctx(), &info, None, &params, "1234", false)
            .await
            .unwrap();

        f.runner.cleanup_all(true).await;
        assert!(f.runtime.removed().is_empty());

        f.runner.cleanup_all(false).await;
        assert_eq!(f.runtime.removed().len(), 1);
        assert!(f.runner.handles().is_empty());
        assert!(matches!(f.rx.recv().await, Some(Message::Finished { .. })));
    }

    #[tokio::test]
    async fn test_released_units_are_not_removed() {
        let mut f = fixture(MockBehavior::Manual);
        let info = module_info("mock_app", "mock_app:latest");
        let params = JobParams::new("mock_app.bogus", json!([]));
        f.runner
            .run(&ctx(), &info, None, &params, "1234", false)
            .await
            .unwrap();
        f.runner
            .run(&ctx(), &info, None, &params, "5678", true)
            .await
            .unwrap();

        assert!(f.runtime.complete("5678", json!({"result": []})));
        assert!(matches!(
            f.rx.recv().await,
            Some(Message::Finished { ref job_id, .. }) if job_id == "5678"
        ));
        f.runner.release("5678");
        assert_eq!(f.runner.handles().len(), 1);

        f.runner.cleanup_all(false).await;
        let removed = f.runtime.removed();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].job_id, "1234");
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The orchestrator.
//!
//! [`JobRunner`] drives one top-level job from start to finish:
//!
//! 1. **INIT**: refuse jobs that already ran, fetch parameters and server
//!    configuration, mark the job started, validate the token, check the
//!    workspace and start the callback gateway.
//! 2. **RUNNING**: start the main method.
//! 3. **WATCHING**: consume the internal queue, dispatching subjobs and
//!    forwarding outputs to the gateway until the main method finishes or the
//!    job is cancelled.
//! 4. **DONE**: report the result to the coordinator, clean up and stop the
//!    gateway.
//!
//! Errors before WATCHING are returned to the caller. Everything after that
//! resolves to a result payload, possibly an `{"error": ...}` one.

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::catalog_cache::{CachePolicy, CatalogCache};
use crate::clients::{Auth, Catalog, Coordinator, FinishJobParams};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{self, GatewayHandle, GatewaySettings, GatewayState};
use crate::job::{JobError, JobParams, output_error};
use crate::logger::JobLogger;
use crate::message::{Message, MessageReceiver, MessageSender, queue};
use crate::method_runner::{JobContext, MethodRunner};
use crate::provenance::{Action, Provenance};
use crate::runtime::ContainerRuntime;
use crate::special_runner::SpecialRunner;

/// Error code reported to the coordinator when the runner itself fails.
pub const TERMINATED_ERROR_CODE: i64 = 2;

/// Extract the cgroup of an HTCondor slot from `/proc/<pid>/cgroup` contents.
pub fn parse_cgroup(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter(|line| line.contains("htcondor"))
        .find_map(|line| {
            let items: Vec<&str> = line.split(':').collect();
            match items.as_slice() {
                [_, _, path] => Some(path.trim().to_string()),
                _ => None,
            }
        })
}

async fn discover_cgroup() -> Option<String> {
    match tokio::fs::read_to_string("/proc/self/cgroup").await {
        Ok(contents) => parse_cgroup(&contents),
        Err(e) => {
            debug!(error = %e, "No cgroup information");
            None
        }
    }
}

/// Builder for a [`JobRunner`].
#[derive(Default)]
pub struct JobRunnerBuilder {
    config: Option<Config>,
    coordinator: Option<Arc<dyn Coordinator>>,
    catalog: Option<Arc<dyn Catalog>>,
    admin_catalog: Option<Arc<dyn Catalog>>,
    auth: Option<Arc<dyn Auth>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    listener: Option<TcpListener>,
}

impl JobRunnerBuilder {
    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the coordinator client (required).
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Set the catalog client authenticated as the user (required).
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the privileged catalog client used for volume mount lookups.
    ///
    /// Without it no volume mounts are applied.
    pub fn admin_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.admin_catalog = Some(catalog);
        self
    }

    /// Set the auth client (required).
    pub fn auth(mut self, auth: Arc<dyn Auth>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set the container runtime (required).
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Serve the gateway on an already bound listener instead of binding
    /// `callback_port`.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the runner. Returns an error if a required part is missing.
    pub fn build(self) -> Result<JobRunner> {
        let missing = |what: &str| Error::Other(format!("{} is required", what));
        let config = self.config.ok_or_else(|| missing("config"))?;
        let coordinator = self.coordinator.ok_or_else(|| missing("coordinator"))?;
        let catalog = self.catalog.ok_or_else(|| missing("catalog"))?;
        let auth = self.auth.ok_or_else(|| missing("auth"))?;
        let runtime = self.runtime.ok_or_else(|| missing("runtime"))?;

        let (tx, rx) = queue();
        let logger = JobLogger::new(config.job_id.clone(), coordinator.clone());
        let method_runner = MethodRunner::new(&config, runtime, logger.clone(), tx.clone());
        let special_runner = SpecialRunner::new(&config, logger.clone(), tx.clone());
        let cache = CatalogCache::new(catalog, self.admin_catalog, config.cache_policy);

        Ok(JobRunner {
            config,
            coordinator,
            auth,
            cache,
            logger,
            method_runner,
            special_runner,
            tx,
            rx,
            listener: self.listener,
        })
    }
}

/// Per-run state of the watch loop.
struct Run {
    ctx: JobContext,
    prov: Provenance,
    to_gateway: MessageSender,
    outstanding: usize,
    expires_at: Option<DateTime<Utc>>,
    last_cancel_check: Instant,
}

/// Runs one job.
pub struct JobRunner {
    config: Config,
    coordinator: Arc<dyn Coordinator>,
    auth: Arc<dyn Auth>,
    cache: CatalogCache,
    logger: JobLogger,
    method_runner: MethodRunner,
    special_runner: SpecialRunner,
    tx: MessageSender,
    rx: MessageReceiver,
    listener: Option<TcpListener>,
}

impl JobRunner {
    /// Create a builder.
    pub fn builder() -> JobRunnerBuilder {
        JobRunnerBuilder::default()
    }

    /// The job this runner executes.
    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    /// A sender on the orchestrator queue. Sending [`Message::Cancel`] tears
    /// the job down.
    pub fn cancel_sender(&self) -> MessageSender {
        self.tx.clone()
    }

    /// Run the job to completion and return its result.
    ///
    /// The result has already been reported to the coordinator when this
    /// returns `Ok`. An `Err` means the job never reached the watch loop; the
    /// caller decides whether to [`terminate_job`](Self::terminate_job).
    pub async fn run(&mut self) -> Result<Value> {
        let job_id = self.config.job_id.clone();
        let (params, mut run, gateway) = self.init().await?;

        self.logger
            .log(format!(
                "Job is about to run {}",
                params.app_id.as_deref().unwrap_or(&params.method)
            ))
            .await;

        let output = match self.dispatch(&mut run, &params, &job_id, false).await {
            Ok(()) => self.watch(&mut run).await,
            Err(e) => {
                self.logger.error(format!("Failed to start job: {}", e)).await;
                self.teardown().await;
                gateway.stop().await;
                return Err(e);
            }
        };

        self.logger.log("Job is done").await;
        self.finish(&output).await;
        self.teardown().await;
        gateway.stop().await;
        Ok(output)
    }

    /// Best-effort failure report for a job that could not run.
    ///
    /// Tries `finish_job` first and falls back to `cancel_job`.
    pub async fn terminate_job(&self, error: &Error) {
        let job_id = &self.config.job_id;
        let params = FinishJobParams {
            job_id: job_id.clone(),
            error_message: Some(error.to_string()),
            error_code: Some(TERMINATED_ERROR_CODE),
            ..Default::default()
        };
        match self.coordinator.finish_job(params).await {
            Ok(()) => info!(job_id = %job_id, "Job terminated"),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "finish_job failed, cancelling instead");
                if let Err(e) = self
                    .coordinator
                    .cancel_job(job_id, TERMINATED_ERROR_CODE)
                    .await
                {
                    error!(job_id = %job_id, error = %e, "Failed to terminate job");
                }
            }
        }
    }

    async fn init(&mut self) -> Result<(JobParams, Run, GatewayHandle)> {
        let job_id = self.config.job_id.clone();
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ip = match self.config.callback_ip {
            Some(ip) => {
                self.logger.log(format!("Callback IP provided ({})", ip)).await;
                ip
            }
            None => gateway::outward_ip().unwrap_or_else(|e| {
                warn!(error = %e, "Could not determine outward IP, using loopback");
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }),
        };

        let running = format!(
            "Running job {} ({}) on {} ({}) in {}",
            job_id,
            std::env::var("CONDOR_ID").unwrap_or_default(),
            hostname,
            ip,
            self.config.workdir.display()
        );
        info!(job_id = %job_id, hostname = %hostname, ip = %ip, "Starting job");
        self.logger.log(running).await;
        self.logger
            .log(format!("Client group: {}", self.config.client_group))
            .await;

        if !self.still_runnable().await {
            self.logger.error("Job already run or terminated").await;
            return Err(Error::JobNotRunnable(job_id));
        }

        let params = match self.coordinator.get_job_params(&job_id).await {
            Ok(params) => params,
            Err(e) => {
                self.logger.error("Failed to get job parameters. Exiting.").await;
                return Err(e.into());
            }
        };
        let server_config = match self.coordinator.list_config().await {
            Ok(config) => config,
            Err(e) => {
                self.logger.error("Failed to get config. Exiting.").await;
                return Err(e.into());
            }
        };
        self.logger
            .log(format!(
                "Server version of Execution Engine: {}",
                server_config.get("ee.server.version").unwrap_or_default()
            ))
            .await;

        if let Err(e) = self.coordinator.start_job(&job_id).await {
            self.logger
                .error("Job already started once. Job restarts are not currently supported")
                .await;
            return Err(Error::CantRestartJob(e.to_string()));
        }

        if !Path::new(&self.config.workdir).exists() {
            self.logger.error("Missing workdir").await;
            return Err(Error::MissingWorkdir(self.config.workdir.clone()));
        }

        let token_info = match self.auth.token_info(&self.config.token).await {
            Ok(info) => info,
            Err(e) => {
                self.logger.error("Token validation failed").await;
                return Err(Error::TokenValidation(e.to_string()));
            }
        };

        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => gateway::bind(self.config.callback_port)?,
        };
        let port = listener.local_addr()?.port();
        let callback_url = format!("http://{}:{}/", ip, port);
        self.logger
            .log(format!("Job runner received Callback URL {}", callback_url))
            .await;

        let (to_gateway, gateway_inbox) = queue();
        let settings = GatewaySettings {
            token: self.config.token.clone(),
            bypass_token: self.config.bypass_token,
            sync_poll_interval: self.config.timing.sync_poll_interval,
            sync_call_timeout: self.config.timing.sync_call_timeout,
        };
        let gateway = gateway::start(
            listener,
            GatewayState::new(settings, self.tx.clone(), gateway_inbox),
        )
        .map_err(|e| Error::Gateway(e.to_string()))?;

        let run = Run {
            ctx: JobContext {
                user: token_info.user.clone(),
                callback_url,
                server_config,
                cgroup: discover_cgroup().await,
            },
            prov: Provenance::new(&params),
            to_gateway,
            outstanding: 0,
            expires_at: token_info.expires_at(),
            last_cancel_check: Instant::now(),
        };
        Ok((params, run, gateway))
    }

    /// Whether the coordinator still considers the job runnable.
    ///
    /// A failed check is retried once; if that fails too the job is assumed
    /// to be runnable.
    async fn still_runnable(&self) -> bool {
        let job_id = &self.config.job_id;
        let status = match self.coordinator.check_job_canceled(job_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job cancel check failed, retrying");
                tokio::time::sleep(self.config.timing.retry_delay).await;
                match self.coordinator.check_job_canceled(job_id).await {
                    Ok(status) => status,
                    Err(e) => {
                        self.logger
                            .error(format!(
                                "Warning: Job cancel check failed due to {}. However, the job will continue to run.",
                                e
                            ))
                            .await;
                        return true;
                    }
                }
            }
        };
        !status.finished
    }

    fn token_expired(&self, run: &Run) -> bool {
        let Some(expires_at) = run.expires_at else {
            return false;
        };
        // A negative remaining lifetime fails the conversion.
        (expires_at - Utc::now())
            .to_std()
            .map_or(true, |left| left < self.config.timing.token_margin)
    }

    async fn watch(&mut self, run: &mut Run) -> Value {
        let job_id = self.config.job_id.clone();
        loop {
            if self.token_expired(run) {
                self.logger.error("Token has expired").await;
                self.teardown().await;
                return JobError::cancelled("Token has expired").into_payload();
            }

            if run.last_cancel_check.elapsed() >= self.config.timing.cancel_check_interval {
                run.last_cancel_check = Instant::now();
                if !self.still_runnable().await {
                    self.logger.error("Job canceled or unexpected error").await;
                    self.teardown().await;
                    return JobError::cancelled("Canceled or unexpected error").into_payload();
                }
            }

            let message =
                match tokio::time::timeout(self.config.timing.poll_interval, self.rx.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) | Err(_) => continue,
                };
            debug!(kind = message.kind(), "Watch loop message");

            match message {
                Message::Submit {
                    job_id: subjob_id,
                    params,
                } => {
                    if run.outstanding > self.config.max_tasks {
                        self.logger.error("Too many subtasks").await;
                        self.teardown().await;
                        return JobError::cancelled("Too many subtasks").into_payload();
                    }
                    if let Err(e) = self.dispatch(run, &params, &subjob_id, true).await {
                        self.logger
                            .error(format!("Failed to submit subjob {}: {}", subjob_id, e))
                            .await;
                        let payload = JobError::dispatch_failed(e).into_payload();
                        self.forward(run, Message::Output {
                            job_id: subjob_id,
                            payload,
                        });
                    }
                }
                Message::Finished {
                    job_id: finished_id,
                    output,
                } => {
                    let is_main = finished_id == job_id;
                    let output = match output {
                        Some(output) => output,
                        None => {
                            self.method_runner
                                .get_output(&finished_id, !is_main, self.config.max_output_bytes)
                                .await
                        }
                    };
                    if let Some(result) = self.complete(run, finished_id, output, is_main).await {
                        return result;
                    }
                }
                Message::FinishedSpecial {
                    job_id: finished_id,
                    result,
                } => {
                    let is_main = finished_id == job_id;
                    if let Some(result) = self.complete(run, finished_id, result, is_main).await {
                        return result;
                    }
                }
                Message::Cancel => {
                    self.logger.error("Job was cancelled").await;
                    self.teardown().await;
                    return JobError::cancelled("Job was cancelled").into_payload();
                }
                other => debug!(kind = other.kind(), "Ignoring message on orchestrator queue"),
            }
        }
    }

    /// Record a finished unit. Returns the job result when the main unit finished.
    async fn complete(
        &mut self,
        run: &mut Run,
        job_id: String,
        output: Value,
        is_main: bool,
    ) -> Option<Value> {
        run.outstanding = run.outstanding.saturating_sub(1);
        self.method_runner.release(&job_id);
        self.special_runner.release(&job_id);
        info!(job_id = %job_id, outstanding = run.outstanding, "Unit finished");
        self.forward(run, Message::Output {
            job_id,
            payload: output.clone(),
        });
        if !is_main {
            return None;
        }
        if run.outstanding > 0 {
            warn!(outstanding = run.outstanding, "Main job finished with subjobs outstanding");
            self.logger.error("Orphaned containers may be present").await;
        }
        Some(output)
    }

    /// Start a (sub)job on the runner its method namespace selects.
    async fn dispatch(
        &mut self,
        run: &mut Run,
        params: &JobParams,
        job_id: &str,
        subjob: bool,
    ) -> Result<()> {
        let method = params.method_ref()?;
        let mounts = self
            .cache
            .resolve_volume_mounts(&method.module, &method.method, &self.config.client_group)
            .await?;

        if params.is_special() {
            self.special_runner
                .run(&run.ctx, params, job_id, mounts.as_deref())
                .await?;
        } else {
            let info = self
                .cache
                .resolve(&method.module, params.service_ver.as_deref())
                .await?;
            if !info.cached {
                self.logger
                    .log(format!(
                        "Running module {}: url: {} commit: {}",
                        method.module, info.git_url, info.git_commit_hash
                    ))
                    .await;
            } else if self.config.cache_policy == CachePolicy::Warn {
                self.logger
                    .error(format!(
                        "WARNING: Module {} was already used once for this job. Using cached version: url: {} commit: {} version: {}",
                        method.module,
                        info.git_url,
                        info.git_commit_hash,
                        info.version.as_deref().unwrap_or_default()
                    ))
                    .await;
            }
            let action = self
                .method_runner
                .run(&run.ctx, &info, mounts.as_deref(), params, job_id, subjob)
                .await?;
            self.record(run, action);
        }

        run.outstanding += 1;
        Ok(())
    }

    fn record(&self, run: &mut Run, action: Action) {
        if !run.prov.add_subaction(action) {
            debug!("Module already recorded in provenance");
        }
        let snapshot = run.prov.snapshot();
        self.forward(run, Message::Prov(snapshot));
    }

    fn forward(&self, run: &Run, message: Message) {
        if run.to_gateway.send(message).is_err() {
            warn!("Gateway queue closed");
        }
    }

    async fn finish(&self, output: &Value) {
        let job_id = &self.config.job_id;
        let params = match output_error(output) {
            Some(error) => {
                let message = "Job output contains an error";
                self.logger.error(format!("{} {}", message, error)).await;
                FinishJobParams::failure(job_id.clone(), message, error.clone())
            }
            None => FinishJobParams::success(job_id.clone(), output.clone()),
        };
        if let Err(e) = self.coordinator.finish_job(params).await {
            error!(job_id = %job_id, error = %e, "Failed to report job result");
        }
    }

    /// Remove every tracked unit, unless in debug mode.
    async fn teardown(&mut self) {
        self.method_runner.cleanup_all(self.config.debug).await;
        self.special_runner.cleanup_all(self.config.debug).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup() {
        let contents = "\
12:pids:/user.slice
11:memory:/htcondor/condor_var_lib_condor_execute_slot1_1@host
0::/user.slice/user-1000.slice";
        assert_eq!(
            parse_cgroup(contents).as_deref(),
            Some("/htcondor/condor_var_lib_condor_execute_slot1_1@host")
        );
        assert_eq!(parse_cgroup("0::/user.slice"), None);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = JobRunner::builder()
            .config(Config::new("1234", "https://ci.kbase.us/services/ee2", "token"))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("coordinator is required"));
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory collaborators for testing.
//!
//! Simple implementations of [`Coordinator`], [`Catalog`] and [`Auth`] that
//! record every call and never touch the network.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::*;
use crate::job::JobParams;
use crate::logger::LogLine;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct CoordinatorState {
    params: Option<JobParams>,
    config: ServerConfig,
    cancel_status: CancelStatus,
    fail_cancel_checks: bool,
    fail_start: bool,
    fail_logs: bool,
    cancel_checks: usize,
    log_batches: usize,
    logs: Vec<LogLine>,
    started: Vec<String>,
    finished: Vec<FinishJobParams>,
    cancelled: Vec<(String, i64)>,
}

/// Mock coordinator for testing.
#[derive(Debug, Default)]
pub struct MockCoordinator {
    state: Mutex<CoordinatorState>,
}

impl MockCoordinator {
    /// Create a coordinator with no job parameters and an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `params` from `get_job_params`.
    pub fn with_params(self, params: JobParams) -> Self {
        lock(&self.state).params = Some(params);
        self
    }

    /// Serve `config` from `list_config`.
    pub fn with_config(self, config: ServerConfig) -> Self {
        lock(&self.state).config = config;
        self
    }

    /// Change what `check_job_canceled` reports.
    pub fn set_canceled(&self, finished: bool, canceled: bool) {
        let mut state = lock(&self.state);
        state.cancel_status.finished = finished;
        state.cancel_status.canceled = canceled;
    }

    /// Make `check_job_canceled` fail.
    pub fn fail_cancel_checks(&self, fail: bool) {
        lock(&self.state).fail_cancel_checks = fail;
    }

    /// Make `start_job` fail as if the job had already been started.
    pub fn fail_start(&self, fail: bool) {
        lock(&self.state).fail_start = fail;
    }

    /// Make `add_job_logs` fail.
    pub fn fail_logs(&self, fail: bool) {
        lock(&self.state).fail_logs = fail;
    }

    /// Number of `check_job_canceled` calls so far.
    pub fn cancel_checks(&self) -> usize {
        lock(&self.state).cancel_checks
    }

    /// Number of `add_job_logs` calls so far.
    pub fn log_batches(&self) -> usize {
        lock(&self.state).log_batches
    }

    /// All shipped log lines.
    pub fn logs(&self) -> Vec<LogLine> {
        lock(&self.state).logs.clone()
    }

    /// Job ids passed to `start_job`.
    pub fn started(&self) -> Vec<String> {
        lock(&self.state).started.clone()
    }

    /// Parameters passed to `finish_job`.
    pub fn finished(&self) -> Vec<FinishJobParams> {
        lock(&self.state).finished.clone()
    }

    /// Arguments passed to `cancel_job`.
    pub fn cancelled(&self) -> Vec<(String, i64)> {
        lock(&self.state).cancelled.clone()
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn check_job_canceled(&self, job_id: &str) -> Result<CancelStatus> {
        let mut state = lock(&self.state);
        state.cancel_checks += 1;
        if state.fail_cancel_checks {
            return Err(ClientError::Other("coordinator unreachable".to_string()));
        }
        Ok(CancelStatus {
            job_id: job_id.to_string(),
            ..state.cancel_status.clone()
        })
    }

    async fn get_job_params(&self, job_id: &str) -> Result<JobParams> {
        lock(&self.state)
            .params
            .clone()
            .ok_or_else(|| ClientError::Other(format!("No parameters for job {}", job_id)))
    }

    async fn list_config(&self) -> Result<ServerConfig> {
        Ok(lock(&self.state).config.clone())
    }

    async fn start_job(&self, job_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_start {
            return Err(ClientError::Rpc {
                name: "JSONRPCError".to_string(),
                code: -32000,
                message: format!("Job {} has already been started", job_id),
            });
        }
        state.started.push(job_id.to_string());
        Ok(())
    }

    async fn finish_job(&self, params: FinishJobParams) -> Result<()> {
        lock(&self.state).finished.push(params);
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str, terminated_code: i64) -> Result<()> {
        lock(&self.state)
            .cancelled
            .push((job_id.to_string(), terminated_code));
        Ok(())
    }

    async fn add_job_logs(&self, _job_id: &str, lines: &[LogLine]) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_logs {
            return Err(ClientError::Other("log service unavailable".to_string()));
        }
        state.log_batches += 1;
        state.logs.extend_from_slice(lines);
        Ok(())
    }
}

/// Build a catalog entry for `module` served from `image`.
pub fn module_info(module: &str, image: &str) -> ModuleInfo {
    ModuleInfo {
        module_name: module.to_string(),
        image: image.to_string(),
        git_url: format!("https://github.com/kbasetest/{}", module),
        git_commit_hash: "b0d92a4a7a7ed0ad2e5b64e44cf1c1b8c2a1f7e6".to_string(),
        version: Some("0.0.1".to_string()),
        data_folder: None,
        data_version: None,
        secure_config_params: Vec::new(),
        cached: false,
    }
}

#[derive(Debug, Default)]
struct CatalogState {
    modules: HashMap<String, ModuleInfo>,
    secure_params: HashMap<String, Vec<SecureConfigParam>>,
    volume_mounts: Vec<VolumeMountConfig>,
    lookups: usize,
    mount_lookups: usize,
}

/// Mock catalog for testing.
#[derive(Debug, Default)]
pub struct MockCatalog {
    state: Mutex<CatalogState>,
}

impl MockCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module.
    pub fn with_module(self, info: ModuleInfo) -> Self {
        lock(&self.state)
            .modules
            .insert(info.module_name.clone(), info);
        self
    }

    /// Register secure parameters for a module.
    pub fn with_secure_params(self, module: &str, params: Vec<SecureConfigParam>) -> Self {
        lock(&self.state)
            .secure_params
            .insert(module.to_string(), params);
        self
    }

    /// Serve `mounts` from `list_volume_mounts`.
    pub fn with_volume_mounts(self, mounts: Vec<VolumeMountConfig>) -> Self {
        lock(&self.state).volume_mounts = mounts;
        self
    }

    /// Number of `get_module_version` calls so far.
    pub fn lookups(&self) -> usize {
        lock(&self.state).lookups
    }

    /// Number of `list_volume_mounts` calls so far.
    pub fn mount_lookups(&self) -> usize {
        lock(&self.state).mount_lookups
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn get_module_version(&self, module: &str, version: Option<&str>) -> Result<ModuleInfo> {
        let mut state = lock(&self.state);
        state.lookups += 1;
        let mut info = state.modules.get(module).cloned().ok_or_else(|| ClientError::Rpc {
            name: "JSONRPCError".to_string(),
            code: -32500,
            message: format!("Module cannot be found: {}", module),
        })?;
        if let Some(version) = version {
            info.version = Some(version.to_string());
        }
        Ok(info)
    }

    async fn get_secure_config_params(
        &self,
        module: &str,
        _version: Option<&str>,
    ) -> Result<Vec<SecureConfigParam>> {
        Ok(lock(&self.state)
            .secure_params
            .get(module)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_volume_mounts(
        &self,
        module: &str,
        method: &str,
        client_group: &str,
    ) -> Result<Vec<VolumeMountConfig>> {
        let mut state = lock(&self.state);
        state.mount_lookups += 1;
        Ok(state
            .volume_mounts
            .iter()
            .filter(|c| {
                c.module_name == module
                    && c.function_name == method
                    && c.client_group == client_group
            })
            .cloned()
            .collect())
    }
}

/// Mock auth service for testing.
#[derive(Debug, Clone)]
pub struct MockAuth {
    info: Option<TokenInfo>,
}

impl MockAuth {
    /// A token owned by `user` that expires after `lifetime`.
    pub fn valid_for(user: &str, lifetime: Duration) -> Self {
        let lifetime_ms = i64::try_from(lifetime.as_millis()).unwrap_or(i64::MAX / 2);
        Self {
            info: Some(TokenInfo {
                user: user.to_string(),
                expires: Utc::now().timestamp_millis() + lifetime_ms,
            }),
        }
    }

    /// An auth service that rejects every token.
    pub fn rejecting() -> Self {
        Self { info: None }
    }
}

#[async_trait]
impl Auth for MockAuth {
    async fn token_info(&self, _token: &str) -> Result<TokenInfo> {
        self.info.clone().ok_or_else(|| ClientError::Status {
            status: 401,
            body: "Invalid token".to_string(),
        })
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use job_runner::JobRunner;
use job_runner::clients::mock::{MockAuth, MockCatalog, MockCoordinator, module_info};
use job_runner::config::{Config, Timing};
use job_runner::job::JobParams;
use job_runner::runtime::{MockBehavior, MockRuntime, RuntimeSettings};
use serde_json::{Value, json};
use tempfile::TempDir;

pub const JOB_ID: &str = "6046b539ce9c58ecf8c3e5f3";
pub const TOKEN: &str = "bogus";

/// Collaborators of one job run.
pub struct Harness {
    pub dir: TempDir,
    pub coordinator: Arc<MockCoordinator>,
    pub catalog: Arc<MockCatalog>,
    pub runtime: Arc<MockRuntime>,
}

impl Harness {
    /// Main job `mock_app.bogus`, subjob module `echo_test`.
    pub fn new(behavior: MockBehavior) -> Self {
        let params = JobParams::new("mock_app.bogus", json!([{"input": 1}]));
        Self {
            dir: tempfile::tempdir().unwrap(),
            coordinator: Arc::new(MockCoordinator::new().with_params(params)),
            catalog: Arc::new(
                MockCatalog::new()
                    .with_module(module_info("mock_app", "mock_app:latest"))
                    .with_module(module_info("echo_test", "echo_test:latest")),
            ),
            runtime: Arc::new(
                MockRuntime::new(RuntimeSettings {
                    log_interval: Duration::from_millis(10),
                    retry_delay: Duration::from_millis(10),
                    debug: false,
                })
                .with_behavior(behavior),
            ),
        }
    }

    /// Configuration with short intervals and a loopback callback address.
    pub fn config(&self) -> Config {
        let mut config = Config::new(JOB_ID, "https://ci.kbase.us/services/ee2", TOKEN);
        config.workdir = self.dir.path().to_path_buf();
        config.callback_ip = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.timing = Timing {
            poll_interval: Duration::from_millis(20),
            log_interval: Duration::from_millis(10),
            cancel_check_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(10),
            sync_poll_interval: Duration::from_millis(10),
            sync_call_timeout: Duration::from_secs(10),
            batch_poll_interval: Duration::from_millis(20),
            ..Timing::default()
        };
        config
    }

    /// Build a runner whose token is valid for an hour.
    pub fn runner(&self, config: Config) -> JobRunner {
        self.runner_with_auth(config, MockAuth::valid_for("wsadmin", Duration::from_secs(3600)))
    }

    pub fn runner_with_auth(&self, config: Config, auth: MockAuth) -> JobRunner {
        JobRunner::builder()
            .config(config)
            .coordinator(self.coordinator.clone())
            .catalog(self.catalog.clone())
            .auth(Arc::new(auth))
            .runtime(self.runtime.clone())
            .listener(TcpListener::bind("127.0.0.1:0").unwrap())
            .build()
            .unwrap()
    }

    /// Wait for the main container and return its callback URL.
    pub async fn callback_url(&self) -> String {
        for _ in 0..500 {
            if let Some(options) = self.runtime.started().first() {
                return options.env["SDK_CALLBACK_URL"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("main job never started");
    }

    /// Wait until `n` units have been started.
    pub async fn wait_started(&self, n: usize) {
        for _ in 0..500 {
            if self.runtime.started().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} started units", n);
    }
}

/// POST a JSON-RPC style request to the gateway.
pub async fn rpc(url: &str, token: Option<&str>, body: Value) -> reqwest::Response {
    let mut request = reqwest::Client::new().post(url).json(&body);
    if let Some(token) = token {
        request = request.header("Authorization", token);
    }
    request.send().await.unwrap()
}

/// Poll `_check_job` until the job is reported finished.
pub async fn wait_finished(url: &str, job_id: &str) -> Value {
    for _ in 0..500 {
        let reply: Value = rpc(url, None, json!({"method": "echo_test._check_job", "params": [job_id]}))
            .await
            .json()
            .await
            .unwrap();
        if reply["result"][0]["finished"] == 1 {
            return reply["result"][0].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never finished", job_id);
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates containers without a container engine. A simulated container
//! "runs" by writing `output.json` into the directory mounted at
//! `/kb/module/work`, exactly where a real SDK module would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;

use super::watcher::{UnitKind, supervise};
use super::{ContainerRuntime, Result, RunHandle, RuntimeError, RuntimeSettings, StartOptions};
use crate::logger::{JobLogger, LogLine};
use crate::message::MessageSender;

/// Mount point of the job directory inside method containers.
const WORK_DIR: &str = "/kb/module/work";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a simulated container behaves.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Write `output` (if any) to output.json after `delay`, then exit.
    Complete {
        /// Content of output.json, `None` writes nothing.
        output: Option<Value>,
        /// Simulated run time.
        delay: Duration,
    },
    /// Run until [`MockRuntime::complete`] or [`ContainerRuntime::remove`] is called.
    Manual,
    /// The watcher fails with an error.
    FailWatcher,
    /// The watcher panics.
    PanicWatcher,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self::Complete {
            output: Some(serde_json::json!({"result": ["ok"]})),
            delay: Duration::from_millis(10),
        }
    }
}

/// Mock runtime for testing.
#[derive(Debug, Default)]
pub struct MockRuntime {
    settings: RuntimeSettings,
    behavior: Mutex<MockBehavior>,
    image_behaviors: Mutex<HashMap<String, MockBehavior>>,
    missing_images: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<StartOptions>>,
    handles: Mutex<Vec<RunHandle>>,
    removed: Mutex<Vec<RunHandle>>,
    manual: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    counter: AtomicUsize,
}

impl MockRuntime {
    /// Create a mock runtime whose containers succeed with `{"result": ["ok"]}`.
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    /// Set the behaviour of every image without an override.
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *lock(&self.behavior) = behavior;
        self
    }

    /// Override the behaviour of one image.
    pub fn set_image_behavior(&self, image: &str, behavior: MockBehavior) {
        lock(&self.image_behaviors).insert(image.to_string(), behavior);
    }

    /// Make the next `failures` lookups of `image` report it as missing.
    pub fn set_missing_image(&self, image: &str, failures: usize) {
        lock(&self.missing_images).insert(image.to_string(), failures);
    }

    /// Options of every started unit, in start order.
    pub fn started(&self) -> Vec<StartOptions> {
        lock(&self.started).clone()
    }

    /// Handles of every started unit.
    pub fn handles(&self) -> Vec<RunHandle> {
        lock(&self.handles).clone()
    }

    /// Handles passed to `remove`.
    pub fn removed(&self) -> Vec<RunHandle> {
        lock(&self.removed).clone()
    }

    /// Finish a [`MockBehavior::Manual`] unit with `output`.
    pub fn complete(&self, job_id: &str, output: Value) -> bool {
        match lock(&self.manual).remove(job_id) {
            Some(tx) => tx.send(output).is_ok(),
            None => false,
        }
    }

    fn behavior_for(&self, image: &str) -> MockBehavior {
        lock(&self.image_behaviors)
            .get(image)
            .cloned()
            .unwrap_or_else(|| lock(&self.behavior).clone())
    }
}

async fn write_output(options: &StartOptions, output: &Value) -> std::io::Result<()> {
    if let Some(mount) = options.mount_for(WORK_DIR) {
        tokio::fs::write(mount.host.join("output.json"), serde_json::to_vec(output)?).await?;
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    async fn resolve_image(&self, image: &str) -> Result<Option<String>> {
        let mut missing = lock(&self.missing_images);
        if let Some(remaining) = missing.get_mut(image)
            && *remaining > 0
        {
            *remaining -= 1;
            return Ok(None);
        }
        Ok(Some(format!("sha256:mock-{}", image)))
    }

    async fn start(
        &self,
        options: StartOptions,
        logger: JobLogger,
        queues: Vec<MessageSender>,
    ) -> Result<RunHandle> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = RunHandle {
            handle_id: format!("mock_{}", n),
            job_id: options.job_id.clone(),
            runtime: self.runtime_type(),
            started_at: Utc::now(),
            pid: None,
        };
        lock(&self.started).push(options.clone());
        lock(&self.handles).push(handle.clone());

        let behavior = self.behavior_for(&options.image);
        let manual = match behavior {
            MockBehavior::Manual => {
                let (tx, rx) = oneshot::channel();
                lock(&self.manual).insert(options.job_id.clone(), tx);
                Some(rx)
            }
            _ => None,
        };

        let job_id = options.job_id.clone();
        let watch = async move {
            logger
                .log_lines(vec![LogLine::stdout(format!("Running {}", options.image))])
                .await;
            match behavior {
                MockBehavior::Complete { output, delay } => {
                    tokio::time::sleep(delay).await;
                    if let Some(output) = output {
                        write_output(&options, &output).await?;
                    }
                }
                MockBehavior::Manual => {
                    if let Some(rx) = manual
                        && let Ok(output) = rx.await
                    {
                        write_output(&options, &output).await?;
                    }
                }
                MockBehavior::FailWatcher => {
                    return Err(RuntimeError::Other("mock watcher failure".to_string()));
                }
                MockBehavior::PanicWatcher => panic!("mock watcher panic"),
            }
            Ok::<_, RuntimeError>(None)
        };

        supervise(UnitKind::Container, job_id, queues, watch, || async {});
        Ok(handle)
    }

    async fn remove(&self, handle: &RunHandle) {
        lock(&self.manual).remove(&handle.job_id);
        lock(&self.removed).push(handle.clone());
    }
}

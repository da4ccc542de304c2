// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime backends.
//!
//! A backend resolves images, starts units of work detached and supervises
//! them in the background. Every started unit produces exactly one
//! `finished` message on each queue passed to [`ContainerRuntime::start`].
//!
//! Backends:
//! - [`DockerRuntime`]: docker CLI (default)
//! - [`ShifterRuntime`]: shifter launcher subprocess
//! - [`MockRuntime`]: in-process simulation for tests

pub mod docker;
pub mod logs;
pub mod mock;
pub mod shifter;
pub mod watcher;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::logger::JobLogger;
use crate::message::MessageSender;

pub use docker::DockerRuntime;
pub use mock::{MockBehavior, MockRuntime};
pub use shifter::ShifterRuntime;

/// Errors from runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// Image could not be found locally or pulled.
    #[error("Couldn't find image for {0}")]
    ImageNotFound(String),

    /// Unit of work failed to start.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// A runtime command exited with an error.
    #[error("{command} exited with {code:?}: {stderr}")]
    Command {
        /// Command name.
        command: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Selectable container runtimes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Docker engine through the docker CLI.
    #[default]
    Docker,
    /// Shifter (HPC) launcher.
    Shifter,
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "shifter" => Ok(Self::Shifter),
            other => Err(format!("unknown runtime: {}", other)),
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Shifter => f.write_str("shifter"),
        }
    }
}

/// A host directory bound into the unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Host path.
    pub host: PathBuf,
    /// Path inside the container.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Create a mount.
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>, read_only: bool) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only,
        }
    }

    /// `host:container:ro|rw`, the form docker and shifter accept.
    pub fn spec(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host.display(),
            self.container,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Everything a backend needs to start one unit of work.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Job or subjob id.
    pub job_id: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Bind mounts.
    pub mounts: Vec<BindMount>,
    /// Administrative labels.
    pub labels: BTreeMap<String, String>,
    /// Parent cgroup, if running under a batch slot.
    pub cgroup: Option<String>,
}

impl StartOptions {
    /// Host directory mounted at `container`, if any.
    pub fn mount_for(&self, container: &str) -> Option<&BindMount> {
        self.mounts.iter().find(|m| m.container == container)
    }
}

/// Reference to a started unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    /// Backend-specific id (container id, pid, mock id).
    pub handle_id: String,
    /// Job id the unit runs.
    pub job_id: String,
    /// Backend that created the handle.
    pub runtime: &'static str,
    /// When the unit was started.
    pub started_at: DateTime<Utc>,
    /// Pid of the launcher process, for subprocess backends.
    pub pid: Option<u32>,
}

/// Settings shared by every backend.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Status/log polling interval.
    pub log_interval: Duration,
    /// Delay before the single image resolution retry.
    pub retry_delay: Duration,
    /// Keep finished units for inspection.
    pub debug: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_interval: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            debug: false,
        }
    }
}

/// Capability set every backend provides.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Backend identifier (e.g. "docker", "shifter").
    fn runtime_type(&self) -> &'static str;

    /// Shared settings.
    fn settings(&self) -> &RuntimeSettings;

    /// Look the image up locally and pull it if absent. `None` if it can't be found.
    async fn resolve_image(&self, image: &str) -> Result<Option<String>>;

    /// Resolve an image, retrying once after `retry_delay`.
    async fn ensure_image(&self, image: &str) -> Result<String> {
        match self.resolve_image(image).await {
            Ok(Some(id)) => return Ok(id),
            Ok(None) => warn!(image = %image, "Image not found, retrying"),
            Err(e) => warn!(image = %image, error = %e, "Image lookup failed, retrying"),
        }
        tokio::time::sleep(self.settings().retry_delay).await;
        self.resolve_image(image)
            .await?
            .ok_or_else(|| RuntimeError::ImageNotFound(image.to_string()))
    }

    /// Start a unit of work detached and begin supervising it.
    ///
    /// Returns as soon as the unit is running. Its log output is shipped
    /// through `logger` and completion is announced on every queue in `queues`.
    async fn start(
        &self,
        options: StartOptions,
        logger: JobLogger,
        queues: Vec<MessageSender>,
    ) -> Result<RunHandle>;

    /// Kill and remove a unit. Errors are ignored, it may already be gone.
    async fn remove(&self, handle: &RunHandle);
}

/// Construct the backend selected in the configuration.
pub fn build_runtime(kind: RuntimeKind, settings: RuntimeSettings) -> Arc<dyn ContainerRuntime> {
    match kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(settings)),
        RuntimeKind::Shifter => Arc::new(ShifterRuntime::new(settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mount_spec() {
        assert_eq!(
            BindMount::new("/tmp/data", "/data", true).spec(),
            "/tmp/data:/data:ro"
        );
        assert_eq!(
            BindMount::new("/mnt/job", "/kb/module/work", false).spec(),
            "/mnt/job:/kb/module/work:rw"
        );
    }

    #[test]
    fn test_runtime_kind_from_str() {
        assert_eq!("Docker".parse::<RuntimeKind>().unwrap(), RuntimeKind::Docker);
        assert_eq!("shifter".parse::<RuntimeKind>().unwrap(), RuntimeKind::Shifter);
        assert!("podman".parse::<RuntimeKind>().is_err());
        assert_eq!(RuntimeKind::Shifter.to_string(), "shifter");
    }

    #[test]
    fn test_build_runtime_selects_backend() {
        let settings = RuntimeSettings::default();
        assert_eq!(build_runtime(RuntimeKind::Docker, settings.clone()).runtime_type(), "docker");
        assert_eq!(build_runtime(RuntimeKind::Shifter, settings).runtime_type(), "shifter");
    }

    #[tokio::test]
    async fn test_ensure_image_retries_once() {
        let runtime = MockRuntime::new(RuntimeSettings {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        });
        runtime.set_missing_image("flaky:latest", 1);
        assert!(runtime.ensure_image("flaky:latest").await.is_ok());

        runtime.set_missing_image("gone:latest", 2);
        assert!(matches!(
            runtime.ensure_image("gone:latest").await,
            Err(RuntimeError::ImageNotFound(_))
        ));
    }
}

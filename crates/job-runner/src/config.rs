// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the job runner.
//!
//! Process inputs are the job id and the coordinator URL (command line) plus
//! the environment variables below.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `KB_AUTH_TOKEN` | `./token` file | User token the job runs as |
//! | `KB_ADMIN_AUTH_TOKEN` | - | Privileged token for volume mount lookups |
//! | `CLIENTGROUP` | `None` | Client group used for volume mount lookups |
//! | `DEBUG_MODE` | `false` | Keep containers and workspaces for inspection |
//! | `JR_MAX_TASKS` | `20` | Maximum outstanding tasks |
//! | `JR_RUNTIME` / `USE_SHIFTER` | `docker` | Container runtime |
//! | `CALLBACK_IP` | outbound IP | Address containers use to reach the gateway |
//! | `CALLBACK_PORT` | `0` (any free) | Gateway port |
//! | `BYPASS_TOKEN` | `false` | Accept gateway submissions without a token |
//! | `JR_WORKDIR` | cwd | Job scratch directory |
//! | `JR_REFDATA_DIR` | `/tmp/ref` | Reference data base directory |
//! | `JR_CACHE_POLICY` | `warn` | `warn` or `silent` on module cache reuse |
//! | `JR_CATALOG_URL` / `JR_AUTH_URL` | derived | Service URL overrides |

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::catalog_cache::CachePolicy;
use crate::runtime::RuntimeKind;

/// Default maximum number of outstanding tasks.
pub const DEFAULT_MAX_TASKS: usize = 20;

/// Default limit for output.json.
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1024 * 1024 * 1024;

/// Poll intervals and timeouts.
#[derive(Debug, Clone)]
pub struct Timing {
    /// How long the watch loop blocks on its queue per iteration.
    pub poll_interval: Duration,
    /// Container status/log polling interval.
    pub log_interval: Duration,
    /// Minimum time between coordinator cancellation checks.
    pub cancel_check_interval: Duration,
    /// Remaining token lifetime below which the job is torn down.
    pub token_margin: Duration,
    /// Delay before the single retry of image pulls and cancellation checks.
    pub retry_delay: Duration,
    /// Gateway polling interval for synchronous calls.
    pub sync_poll_interval: Duration,
    /// Upper bound for a synchronous gateway call.
    pub sync_call_timeout: Duration,
    /// Batch system status polling interval.
    pub batch_poll_interval: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            log_interval: Duration::from_secs(1),
            cancel_check_interval: Duration::from_secs(1),
            token_margin: Duration::from_secs(600),
            retry_delay: Duration::from_secs(5),
            sync_poll_interval: Duration::from_secs(1),
            sync_call_timeout: Duration::from_secs(7 * 24 * 3600),
            batch_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Top-level job id
    pub job_id: String,
    /// Coordinator (EE2) URL
    pub ee2_url: String,
    /// Catalog service URL
    pub catalog_url: String,
    /// Auth service token endpoint
    pub auth_url: String,
    /// User token
    pub token: String,
    /// Privileged token for volume mount lookups
    pub admin_token: Option<String>,
    /// Client group the job runs in
    pub client_group: String,
    /// Debug mode keeps containers around after they exit
    pub debug: bool,
    /// Maximum outstanding tasks before the job is cancelled
    pub max_tasks: usize,
    /// Container runtime
    pub runtime: RuntimeKind,
    /// Address containers use to reach the gateway
    pub callback_ip: Option<IpAddr>,
    /// Gateway port, 0 picks a free port
    pub callback_port: u16,
    /// Accept gateway submissions without a matching token
    pub bypass_token: bool,
    /// Job scratch directory
    pub workdir: PathBuf,
    /// Reference data base directory
    pub refdata_dir: PathBuf,
    /// Behaviour on repeated module resolution
    pub cache_policy: CachePolicy,
    /// Largest output.json that will be read
    pub max_output_bytes: u64,
    /// Workflow engine command for `special.wdl`
    pub wdl_command: String,
    /// Directory holding batch helper commands (`<type>_submit`, ...), PATH if unset
    pub batch_bin_dir: Option<PathBuf>,
    /// Poll intervals and timeouts
    pub timing: Timing,
}

impl Config {
    /// Create a configuration with defaults for everything but the job identity.
    pub fn new(job_id: impl Into<String>, ee2_url: impl Into<String>, token: impl Into<String>) -> Self {
        let ee2_url = ee2_url.into();
        Self {
            job_id: job_id.into(),
            catalog_url: derive_service_url(&ee2_url, "catalog"),
            auth_url: derive_service_url(&ee2_url, "auth/api/V2/token"),
            ee2_url,
            token: token.into(),
            admin_token: None,
            client_group: "None".to_string(),
            debug: false,
            max_tasks: DEFAULT_MAX_TASKS,
            runtime: RuntimeKind::Docker,
            callback_ip: None,
            callback_port: 0,
            bypass_token: false,
            workdir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            refdata_dir: PathBuf::from("/tmp/ref"),
            cache_policy: CachePolicy::Warn,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            wdl_command: "cromwell".to_string(),
            batch_bin_dir: None,
            timing: Timing::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env(job_id: impl Into<String>, ee2_url: impl Into<String>) -> Result<Self, ConfigError> {
        let token = match std::env::var("KB_AUTH_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => std::fs::read_to_string("token")
                .map(|t| t.trim_end().to_string())
                .map_err(|_| ConfigError::MissingToken)?,
        };

        let mut config = Self::new(job_id, ee2_url, token);

        config.admin_token = std::env::var("KB_ADMIN_AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        if let Ok(group) = std::env::var("CLIENTGROUP") {
            config.client_group = group;
        }
        config.debug = parse_env_bool("DEBUG_MODE", false);
        config.bypass_token = parse_env_bool("BYPASS_TOKEN", false);

        if let Ok(v) = std::env::var("JR_MAX_TASKS") {
            config.max_tasks = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("JR_MAX_TASKS", v))?;
        }

        if let Ok(v) = std::env::var("JR_RUNTIME") {
            config.runtime = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("JR_RUNTIME", v))?;
        } else if parse_env_bool("USE_SHIFTER", false) {
            config.runtime = RuntimeKind::Shifter;
        }

        if let Ok(v) = std::env::var("CALLBACK_IP") {
            config.callback_ip = Some(
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("CALLBACK_IP", v))?,
            );
        }
        if let Ok(v) = std::env::var("CALLBACK_PORT") {
            config.callback_port = v.parse().map_err(|_| ConfigError::InvalidPort)?;
        }

        if let Ok(dir) = std::env::var("JR_WORKDIR") {
            config.workdir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("JR_REFDATA_DIR") {
            config.refdata_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("JR_CATALOG_URL") {
            config.catalog_url = url;
        }
        if let Ok(url) = std::env::var("JR_AUTH_URL") {
            config.auth_url = url;
        }
        if let Ok(v) = std::env::var("JR_CACHE_POLICY") {
            config.cache_policy = v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("JR_CACHE_POLICY", v))?;
        }
        if let Ok(cmd) = std::env::var("JR_WDL_COMMAND") {
            config.wdl_command = cmd;
        }
        config.batch_bin_dir = std::env::var("JR_BATCH_BIN_DIR").ok().map(PathBuf::from);

        if let Some(bytes) = parse_env_u64("JR_MAX_OUTPUT_BYTES") {
            config.max_output_bytes = bytes;
        }

        let timing = &mut config.timing;
        if let Some(ms) = parse_env_u64("JR_POLL_INTERVAL_MS") {
            timing.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("JR_LOG_INTERVAL_MS") {
            timing.log_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("JR_CANCEL_CHECK_INTERVAL_MS") {
            timing.cancel_check_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env_u64("JR_TOKEN_MARGIN_SECS") {
            timing.token_margin = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_env_u64("JR_IMAGE_RETRY_DELAY_MS") {
            timing.retry_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env_u64("JR_SYNC_CALL_TIMEOUT_SECS") {
            timing.sync_call_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_env_u64("JR_BATCH_POLL_MS") {
            timing.batch_poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

/// Derive a sibling service URL from the coordinator URL (`.../services/ee2`).
///
/// Only a trailing `ee2` path segment is replaced. A URL without one is taken
/// as the services root.
pub fn derive_service_url(ee2_url: &str, service_path: &str) -> String {
    let base = ee2_url.trim_end_matches('/');
    match base.rsplit_once('/') {
        Some((services, "ee2")) => format!("{}/{}", services, service_path),
        _ => format!("{}/{}", base, service_path),
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Parse an env var into a bool with a sensible default.
fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var).map(|v| parse_bool(&v)).unwrap_or(default)
}

fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No user token in the environment or the working directory.
    #[error("Failed to get token: set KB_AUTH_TOKEN or provide a token file")]
    MissingToken,
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// An environment variable has an unusable value.
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_service_urls() {
        let config = Config::new("1234", "https://ci.kbase.us/services/ee2", "tok");
        assert_eq!(config.catalog_url, "https://ci.kbase.us/services/catalog");
        assert_eq!(config.auth_url, "https://ci.kbase.us/services/auth/api/V2/token");
    }

    #[test]
    fn test_derive_service_url_keeps_host() {
        assert_eq!(
            derive_service_url("https://ee2.example/services/ee2", "catalog"),
            "https://ee2.example/services/catalog"
        );
        assert_eq!(
            derive_service_url("https://ee2.example/services/ee2/", "catalog"),
            "https://ee2.example/services/catalog"
        );
        assert_eq!(
            derive_service_url("http://localhost:8080/services", "catalog"),
            "http://localhost:8080/services/catalog"
        );
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "YES", "on"] {
            assert!(parse_bool(v), "{v}");
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(v), "{v}");
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::new("1234", "http://localhost/services/ee2", "tok");
        assert_eq!(config.max_tasks, DEFAULT_MAX_TASKS);
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.cache_policy, CachePolicy::Warn);
        assert!(!config.bypass_token);
        assert!(config.admin_token.is_none());
        assert_eq!(config.timing.token_margin, Duration::from_secs(600));
    }
}

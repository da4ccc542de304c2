// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job log forwarding.
//!
//! Lines written here end up in the job's log on the coordinator. Each line is
//! also emitted as a `tracing` event so it shows in the runner's own output.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clients::{Coordinator, int_flag};

/// One job log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Line text without the trailing newline.
    pub line: String,
    /// Line came from stderr.
    #[serde(with = "int_flag")]
    pub is_error: bool,
    /// Timestamp reported by the runtime, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl LogLine {
    /// A stdout line.
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            is_error: false,
            ts: None,
        }
    }

    /// A stderr line.
    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            is_error: true,
            ts: None,
        }
    }

    /// Attach a timestamp.
    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// Forwards job-visible log lines to the coordinator.
#[derive(Clone)]
pub struct JobLogger {
    job_id: String,
    coordinator: Arc<dyn Coordinator>,
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl JobLogger {
    /// Create a logger for `job_id`.
    pub fn new(job_id: impl Into<String>, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            job_id: job_id.into(),
            coordinator,
        }
    }

    /// Job id the lines are attributed to.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Log an informational line.
    pub async fn log(&self, line: impl Into<String>) {
        self.log_lines(vec![LogLine::stdout(line)]).await;
    }

    /// Log an error line.
    pub async fn error(&self, line: impl Into<String>) {
        self.log_lines(vec![LogLine::stderr(line)]).await;
    }

    /// Ship a batch of lines. Failures are reported locally and otherwise ignored.
    pub async fn log_lines(&self, lines: Vec<LogLine>) {
        if lines.is_empty() {
            return;
        }
        for l in &lines {
            if l.is_error {
                info!(job_id = %self.job_id, stream = "stderr", "{}", l.line);
            } else {
                info!(job_id = %self.job_id, stream = "stdout", "{}", l.line);
            }
        }
        if let Err(e) = self.coordinator.add_job_logs(&self.job_id, &lines).await {
            warn!(job_id = %self.job_id, error = %e, lines = lines.len(), "Failed to ship job logs");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCoordinator;

    #[tokio::test]
    async fn test_lines_reach_coordinator() {
        let coordinator = Arc::new(MockCoordinator::new());
        let logger = JobLogger::new("1234", coordinator.clone());

        logger.log("hello").await;
        logger.error("boom").await;
        logger.log_lines(vec![]).await;

        let logs = coordinator.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0], LogLine::stdout("hello"));
        assert!(logs[1].is_error);
    }

    #[tokio::test]
    async fn test_ship_failure_is_swallowed() {
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.fail_logs(true);
        let logger = JobLogger::new("1234", coordinator.clone());

        logger.log("dropped").await;
        assert!(coordinator.logs().is_empty());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coordinator (execution_engine2) client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{JsonRpcClient, Result};
use crate::job::JobParams;
use crate::logger::LogLine;

/// Reply of `check_job_canceled`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CancelStatus {
    /// Job id.
    #[serde(default)]
    pub job_id: String,
    /// Job reached a terminal state (finished, errored or canceled).
    #[serde(default)]
    pub finished: bool,
    /// Job was canceled by a user or admin.
    #[serde(default)]
    pub canceled: bool,
}

/// Server-wide configuration returned by `list_config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerConfig(pub HashMap<String, Value>);

impl ServerConfig {
    /// Look up a key, rendering scalars as strings.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// First present key among aliases.
    pub fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get(k))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ServerConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Parameters of `finish_job`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinishJobParams {
    /// Job id.
    pub job_id: String,
    /// Successful job output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_output: Option<Value>,
    /// Error summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Error detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    /// Termination code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_code: Option<i64>,
}

impl FinishJobParams {
    /// Successful completion.
    pub fn success(job_id: impl Into<String>, output: Value) -> Self {
        Self {
            job_id: job_id.into(),
            job_output: Some(output),
            ..Default::default()
        }
    }

    /// Completion with an error result.
    pub fn failure(job_id: impl Into<String>, message: impl Into<String>, error: Value) -> Self {
        Self {
            job_id: job_id.into(),
            error_message: Some(message.into()),
            error: Some(error),
            ..Default::default()
        }
    }
}

/// The coordinator of record for job parameters, status, logs and results.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Whether the job has reached a terminal state on the coordinator side.
    async fn check_job_canceled(&self, job_id: &str) -> Result<CancelStatus>;

    /// Fetch the job's parameters.
    async fn get_job_params(&self, job_id: &str) -> Result<JobParams>;

    /// Fetch the server-wide configuration.
    async fn list_config(&self) -> Result<ServerConfig>;

    /// Mark the job as started. Fails if it was started before.
    async fn start_job(&self, job_id: &str) -> Result<()>;

    /// Report the final result.
    async fn finish_job(&self, params: FinishJobParams) -> Result<()>;

    /// Mark the job as canceled/terminated.
    async fn cancel_job(&self, job_id: &str, terminated_code: i64) -> Result<()>;

    /// Append job log lines.
    async fn add_job_logs(&self, job_id: &str, lines: &[LogLine]) -> Result<()>;
}

/// JSON-RPC client for execution_engine2.
#[derive(Debug, Clone)]
pub struct Ee2Client {
    rpc: JsonRpcClient,
}

impl Ee2Client {
    /// Create a client for the EE2 service at `url`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            rpc: JsonRpcClient::new(
                url,
                "execution_engine2",
                Some(token.into()),
                Duration::from_secs(60),
            )?,
        })
    }
}

#[async_trait]
impl Coordinator for Ee2Client {
    async fn check_job_canceled(&self, job_id: &str) -> Result<CancelStatus> {
        self.rpc
            .call("check_job_canceled", vec![json!({ "job_id": job_id })])
            .await
    }

    async fn get_job_params(&self, job_id: &str) -> Result<JobParams> {
        self.rpc
            .call("get_job_params", vec![json!({ "job_id": job_id })])
            .await
    }

    async fn list_config(&self) -> Result<ServerConfig> {
        self.rpc.call("list_config", vec![]).await
    }

    async fn start_job(&self, job_id: &str) -> Result<()> {
        self.rpc
            .call::<Value>("start_job", vec![json!({ "job_id": job_id })])
            .await
            .map(|_| ())
    }

    async fn finish_job(&self, params: FinishJobParams) -> Result<()> {
        self.rpc
            .call::<Value>("finish_job", vec![serde_json::to_value(params)?])
            .await
            .map(|_| ())
    }

    async fn cancel_job(&self, job_id: &str, terminated_code: i64) -> Result<()> {
        self.rpc
            .call::<Value>(
                "cancel_job",
                vec![json!({ "job_id": job_id, "terminated_code": terminated_code })],
            )
            .await
            .map(|_| ())
    }

    async fn add_job_logs(&self, job_id: &str, lines: &[LogLine]) -> Result<()> {
        self.rpc
            .call::<Value>(
                "add_job_logs",
                vec![json!({ "job_id": job_id }), serde_json::to_value(lines)?],
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_check_job_canceled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "execution_engine2.check_job_canceled",
                "params": [{"job_id": "1234"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{"job_id": "1234", "finished": true, "canceled": true}]
            })))
            .mount(&server)
            .await;

        let ee2 = Ee2Client::new(server.uri(), "tok").unwrap();
        let status = ee2.check_job_canceled("1234").await.unwrap();
        assert!(status.finished);
        assert!(status.canceled);
    }

    #[tokio::test]
    async fn test_add_job_logs_sends_flags_as_ints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "execution_engine2.add_job_logs",
                "params": [{"job_id": "1234"}, [{"line": "boom", "is_error": 1}]]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [1]})))
            .expect(1)
            .mount(&server)
            .await;

        let ee2 = Ee2Client::new(server.uri(), "tok").unwrap();
        ee2.add_job_logs("1234", &[LogLine::stderr("boom")])
            .await
            .unwrap();
    }

    #[test]
    fn test_server_config_aliases() {
        let config: ServerConfig = [("kbase.endpoint", "https://ci.kbase.us/services")]
            .into_iter()
            .collect();
        assert_eq!(
            config.first(&["kbase-endpoint", "kbase.endpoint"]).as_deref(),
            Some("https://ci.kbase.us/services")
        );
        assert!(config.get("missing").is_none());
    }

    #[test]
    fn test_finish_params_skip_empty_fields() {
        let params = FinishJobParams::success("1234", json!({"result": ["ok"]}));
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"job_id": "1234", "job_output": {"result": ["ok"]}}));
    }
}

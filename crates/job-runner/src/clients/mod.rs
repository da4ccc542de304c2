// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clients for the external collaborators: the coordinator (EE2), the module
//! catalog and the auth service.
//!
//! EE2 and the catalog speak KBase JSON-RPC 1.1: every call is a POST of
//! `{"version": "1.1", "method": "<service>.<method>", "params": [...], "id": ...}`
//! and the reply carries either `result` (a list) or `error`.

pub mod auth;
pub mod catalog;
pub mod ee2;
pub mod mock;

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

pub use auth::{Auth, AuthClient, TokenInfo};
pub use catalog::{
    Catalog, CatalogClient, ModuleInfo, SecureConfigParam, VolumeMount, VolumeMountConfig,
};
pub use ee2::{CancelStatus, Coordinator, Ee2Client, FinishJobParams, ServerConfig};

/// Errors from remote service calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service returned a JSON-RPC error object.
    #[error("{name} ({code}): {message}")]
    Rpc {
        /// Error name.
        name: String,
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// Non-success HTTP status without a JSON-RPC error body.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Minimal KBase JSON-RPC 1.1 client.
#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    service: String,
    token: Option<String>,
}

impl JsonRpcClient {
    /// Create a client for `service` at `url`.
    pub fn new(
        url: impl Into<String>,
        service: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            service: service.into(),
            token,
        })
    }

    /// Service URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Call `method` with positional `params` and decode the first result element.
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<R> {
        let body = json!({
            "version": "1.1",
            "method": format!("{}.{}", self.service, method),
            "params": params,
            "id": uuid::Uuid::new_v4().to_string(),
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, token);
        }

        debug!(service = %self.service, method = %method, "JSON-RPC call");
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let reply: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) if status.is_success() => return Err(ClientError::Json(e)),
            Err(_) => {
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    body: text,
                });
            }
        };

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(ClientError::Rpc {
                name: error
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("JSONRPCError")
                    .to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let first = reply
            .get("result")
            .and_then(|r| r.get(0))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(first)?)
    }
}

/// Serde helpers for KBase boolean flags encoded as 0/1.
pub(crate) mod int_flag {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*flag))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
            Value::String(s) => matches!(s.as_str(), "1" | "true"),
            _ => false,
        })
    }
}

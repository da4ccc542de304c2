// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job parameters and structured job error payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Module namespace reserved for non-container methods.
pub const SPECIAL_MODULE: &str = "special";

/// JSON-RPC code used for method/output failures.
pub const METHOD_ERROR_CODE: i64 = -32601;

/// JSON-RPC code used for runner-level failures.
pub const RUNNER_ERROR_CODE: i64 = -32000;

/// Parameters of a job or subjob, as stored by the coordinator or submitted
/// through the gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// Method reference, `module.method`.
    pub method: String,
    /// Method parameters (usually a JSON list).
    #[serde(default)]
    pub params: Value,
    /// Requested module version (git hash, semantic version or release tag).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ver: Option<String>,
    /// Narrative app id, if launched from an app.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Workspace id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wsid: Option<i64>,
    /// Parent job id for subjobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_job_id: Option<String>,
    /// Free-form job metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl JobParams {
    /// Create parameters for a method call.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            ..Default::default()
        }
    }

    /// Parse the method reference.
    pub fn method_ref(&self) -> Result<MethodRef> {
        MethodRef::parse(&self.method)
    }

    /// Whether this job runs through the special runner.
    pub fn is_special(&self) -> bool {
        self.method
            .split_once('.')
            .is_some_and(|(module, _)| module == SPECIAL_MODULE)
    }
}

/// A parsed `module.method` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    /// Module name.
    pub module: String,
    /// Method name within the module.
    pub method: String,
}

impl MethodRef {
    /// Parse `module.method`.
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once('.') {
            Some((module, method)) if !module.is_empty() && !method.is_empty() => Ok(Self {
                module: module.to_string(),
                method: method.to_string(),
            }),
            _ => Err(Error::InvalidMethod(reference.to_string())),
        }
    }
}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.method)
    }
}

/// JSON-RPC style error object placed under the `error` key of a job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Numeric error code.
    pub code: i64,
    /// Short error name.
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Error detail.
    pub error: String,
}

impl JobError {
    /// Create an error object.
    pub fn new(code: i64, name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code,
            name: name.into(),
            error: message.clone(),
            message,
        }
    }

    /// The method did not write output.json.
    pub fn output_not_found() -> Self {
        Self::new(METHOD_ERROR_CODE, "Output not found", "No output generated")
    }

    /// output.json is larger than the configured limit.
    pub fn too_much_output(size: u64, max_size: u64) -> Self {
        Self::new(
            METHOD_ERROR_CODE,
            "Too much output from a method",
            format!("Method returned too much output ({} > {})", size, max_size),
        )
    }

    /// output.json is not valid JSON.
    pub fn malformed_output(reason: impl std::fmt::Display) -> Self {
        Self::new(
            METHOD_ERROR_CODE,
            "Malformed output",
            format!("Method output could not be parsed: {}", reason),
        )
    }

    /// The job was torn down before it finished.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(RUNNER_ERROR_CODE, "Job canceled", reason)
    }

    /// A synchronous gateway call did not complete in time.
    pub fn timeout(job_id: &str) -> Self {
        Self::new(
            RUNNER_ERROR_CODE,
            "Timeout",
            format!("Timed out waiting for job {}", job_id),
        )
    }

    /// A subjob could not be dispatched.
    pub fn dispatch_failed(reason: impl std::fmt::Display) -> Self {
        Self::new(RUNNER_ERROR_CODE, "Submit failed", reason.to_string())
    }

    /// Wrap into a job result payload `{"error": {...}}`.
    pub fn into_payload(self) -> Value {
        json!({ "error": self })
    }
}

/// Return the non-null `error` entry of a job result, if any.
pub fn output_error(output: &Value) -> Option<&Value> {
    output.get("error").filter(|e| !e.is_null())
}

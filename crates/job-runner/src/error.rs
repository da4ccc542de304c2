// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the job runner.

use std::path::PathBuf;

use thiserror::Error;

/// Job runner errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A remote service call failed.
    #[error("Client error: {0}")]
    Client(#[from] crate::clients::ClientError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The scratch directory for the job does not exist.
    #[error("Missing working directory: {}", .0.display())]
    MissingWorkdir(PathBuf),

    /// A volume mount host directory does not exist.
    #[error("Volume mount ({0}) doesn't exist")]
    MissingVolumeMount(String),

    /// Method reference is not of the form `module.method`.
    #[error("Invalid method reference: {0}")]
    InvalidMethod(String),

    /// Special method type is not allowed or its parameters are incomplete.
    #[error("Invalid special job: {0}")]
    InvalidSpecial(String),

    /// The job was already run or cancelled.
    #[error("Job already run or terminated: {0}")]
    JobNotRunnable(String),

    /// The coordinator refused to mark the job as started.
    #[error("Job already started once. Job restarts are not currently supported: {0}")]
    CantRestartJob(String),

    /// The user token could not be validated.
    #[error("Token validation failed: {0}")]
    TokenValidation(String),

    /// The callback gateway could not be started.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the job runner Error.
pub type Result<T> = std::result::Result<T, Error>;

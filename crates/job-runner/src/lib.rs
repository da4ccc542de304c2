// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job Runner - Per-Job Execution Agent
//!
//! One `job-runner` process is started per top-level job. It fetches the job's
//! parameters from the coordinator (EE2), launches the method container,
//! supervises it, dispatches the subjobs the container submits back through the
//! callback gateway, and finally reports the result to the coordinator.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!                 │     Coordinator (EE2)        │
//!                 └──────────────▲───────────────┘
//!                                │ params / status / logs / result
//! ┌──────────────────────────────┴──────────────────────────────────────┐
//! │ job-runner                                                           │
//! │  ┌────────────┐  submit   ┌───────────────┐  start   ┌────────────┐  │
//! │  │ JobRunner  │──────────▶│ MethodRunner  │─────────▶│  Runtime   │  │
//! │  │ watch loop │           │ SpecialRunner │          │ (docker,   │  │
//! │  └─────▲──┬───┘           └───────────────┘          │  shifter)  │  │
//! │        │  │ output/prov                               └─────┬──────┘  │
//! │        │  ▼                                                 │watcher │
//! │  ┌─────┴──────┐ submit/finished/cancel                      │        │
//! │  │  message   │◀────────────────────────────────────────────┘        │
//! │  │  queues    │◀──────────┐                                          │
//! │  └────────────┘           │ submit                                   │
//! │                    ┌──────┴──────┐     HTTP (SDK_CALLBACK_URL)       │
//! │                    │   Gateway   │◀────────── method containers      │
//! │                    └─────────────┘                                   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job State Machine
//!
//! ```text
//! INIT ──▶ RUNNING ──▶ WATCHING ⇄ DISPATCHING ──▶ DONE
//!                          │
//!                          ├── cancelled / token expired ──▶ CANCELLED
//!                          └── too many subtasks ──────────▶ ERROR
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`message`]: Messages exchanged between the watch loop, watchers and the gateway
//! - [`job`]: Job parameters and structured error payloads
//! - [`clients`]: Coordinator, catalog and auth service clients
//! - [`logger`]: Job log forwarding
//! - [`catalog_cache`]: Per-job module metadata cache
//! - [`provenance`]: Provenance ledger
//! - [`runtime`]: Container runtime backends
//! - [`method_runner`]: Container method invocations
//! - [`special_runner`]: Batch (slurm) and WDL invocations
//! - [`gateway`]: Callback HTTP gateway
//! - [`job_runner`]: The orchestrator

pub mod catalog_cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod job_runner;
pub mod logger;
pub mod message;
pub mod method_runner;
pub mod provenance;
pub mod runtime;
pub mod special_runner;

pub use config::Config;
pub use error::Error;
pub use job_runner::JobRunner;

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job Runner - Per-Job Execution Agent
//!
//! Usage: `job-runner <job_id> <ee2_url>`
//!
//! Runs one job end to end and exits with status 0 when its result was
//! reported, 1 when the job had already run, and 2 when it could not be run.

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use job_runner::clients::{AuthClient, Catalog, CatalogClient, Ee2Client};
use job_runner::config::Config;
use job_runner::message::Message;
use job_runner::runtime::{RuntimeSettings, build_runtime};
use job_runner::{Error, JobRunner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "job_runner=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let mut args = std::env::args().skip(1);
    let (Some(job_id), Some(ee2_url)) = (args.next(), args.next()) else {
        anyhow::bail!("Usage: job-runner <job_id> <ee2_url>");
    };

    let config = Config::from_env(job_id, ee2_url)?;
    info!(
        job_id = %config.job_id,
        ee2_url = %config.ee2_url,
        runtime = %config.runtime,
        workdir = %config.workdir.display(),
        "Starting job runner"
    );

    let coordinator = Arc::new(
        Ee2Client::new(&config.ee2_url, &config.token).context("coordinator client")?,
    );
    let catalog = Arc::new(
        CatalogClient::new(&config.catalog_url, &config.token).context("catalog client")?,
    );
    let auth = Arc::new(AuthClient::new(&config.auth_url).context("auth client")?);
    let runtime = build_runtime(
        config.runtime,
        RuntimeSettings {
            log_interval: config.timing.log_interval,
            retry_delay: config.timing.retry_delay,
            debug: config.debug,
        },
    );

    let mut builder = JobRunner::builder()
        .coordinator(coordinator)
        .catalog(catalog)
        .auth(auth)
        .runtime(runtime);
    if let Some(admin_token) = &config.admin_token {
        let admin: Arc<dyn Catalog> = Arc::new(
            CatalogClient::new(&config.catalog_url, admin_token).context("admin catalog client")?,
        );
        builder = builder.admin_catalog(admin);
    }
    let mut runner = builder.config(config).build()?;

    // Ctrl-C tears the job down through the watch loop
    let cancel = runner.cancel_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling job");
            let _ = cancel.send(Message::Cancel);
        }
    });

    match runner.run().await {
        Ok(_) => {
            info!(job_id = %runner.job_id(), "Job runner finished");
            Ok(())
        }
        Err(e @ Error::JobNotRunnable(_)) => {
            error!(error = %e, "Job not runnable");
            std::process::exit(1);
        }
        Err(e) => {
            error!(job_id = %runner.job_id(), error = %e, "Job runner failed");
            runner.terminate_job(&e).await;
            std::process::exit(2);
        }
    }
}

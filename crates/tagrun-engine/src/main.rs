// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagrun Engine - release runner host
//!
//! Serves every repository found under `TAGRUN_REPOS_ROOT`:
//! - one release per configured tag directory
//! - scripts and services projected from each release's `appconfig.yml`
//! - enabled services started and supervised until shutdown

use tracing::{info, warn};

use tagrun_engine::config::Config;
use tagrun_engine::runtime::{EngineRuntime, running_artifacts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tagrun_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        run_dir = %config.run_dir.display(),
        repos_root = %config.repos_root.display(),
        ports = ?config.port_range,
        strategy = %config.stream_strategy,
        "Starting Tagrun Engine"
    );

    let runtime = EngineRuntime::builder()
        .config(&config)
        .build()?
        .start()
        .await?;

    let failures = runtime
        .repositories()
        .open_directory_tree(&config.repos_root)
        .await?;
    for failure in &failures {
        warn!(error = %failure, "Repository sync reported a failure");
    }

    let (scripts, services) = running_artifacts(runtime.repositories());
    info!(
        repositories = runtime.repositories().repositories().len(),
        scripts = runtime.repositories().scripts().len(),
        services = runtime.repositories().services().len(),
        running = scripts.len() + services.len(),
        "Engine ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;
    Ok(())
}

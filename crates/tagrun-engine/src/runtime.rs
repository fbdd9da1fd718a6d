// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tagrun-engine.
//!
//! [`EngineRuntime`] wires the port pool, runner factory, object indices,
//! repository index and background workers together so the engine can be
//! embedded into an existing tokio application.
//!
//! ```rust,ignore
//! use tagrun_engine::config::Config;
//! use tagrun_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = EngineRuntime::builder()
//!         .config(&config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... register repositories, serve requests ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::artifact::{Artifact, Script, Service, ServiceSettings};
use crate::collection::ObjCollection;
use crate::config::{Config, ConfigError};
use crate::error::{Error, Result};
use crate::eviction_worker::{EvictionWorker, EvictionWorkerConfig};
use crate::handlers::EngineHandlerState;
use crate::manifest::AppKind;
use crate::repository_index::RepositoryIndex;
use crate::runner::{PortPool, ProcessRunnerFactory, RunnerFactory, RunnerSettings};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    run_dir: PathBuf,
    factory: Option<Arc<dyn RunnerFactory>>,
    runner_settings: RunnerSettings,
    port_range: Range<u16>,
    service_settings: ServiceSettings,
    eviction_interval: Duration,
    eviction_max_age: Duration,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        let defaults = Config::default();
        Self {
            run_dir: defaults.run_dir,
            factory: None,
            runner_settings: RunnerSettings::default(),
            port_range: defaults.port_range,
            service_settings: ServiceSettings::default(),
            eviction_interval: defaults.eviction_interval,
            eviction_max_age: defaults.eviction_max_age,
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every setting from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.run_dir = config.run_dir.clone();
        self.runner_settings = config.runner_settings();
        self.port_range = config.port_range.clone();
        self.service_settings = config.service_settings();
        self.eviction_interval = config.eviction_interval;
        self.eviction_max_age = config.eviction_max_age;
        self
    }

    /// Set the directory releases are materialized under.
    ///
    /// Default: `/tmp/tagrun`
    pub fn run_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.run_dir = path.into();
        self
    }

    /// Use a custom runner factory instead of spawning OS processes.
    ///
    /// When set, [`runner_settings`](Self::runner_settings) and
    /// [`port_range`](Self::port_range) are ignored.
    pub fn factory(mut self, factory: Arc<dyn RunnerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the settings of the default process runner factory.
    pub fn runner_settings(mut self, settings: RunnerSettings) -> Self {
        self.runner_settings = settings;
        self
    }

    /// Set the half-open port range for port-bound apps.
    ///
    /// Default: `17001..17101`
    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.port_range = range;
        self
    }

    /// Set service supervision parameters.
    pub fn service_settings(mut self, settings: ServiceSettings) -> Self {
        self.service_settings = settings;
        self
    }

    /// Set the orphan-snapshot sweep interval.
    ///
    /// Default: 1 hour
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Set the minimum age of an orphaned snapshot before removal.
    ///
    /// Default: 24 hours
    pub fn eviction_max_age(mut self, max_age: Duration) -> Self {
        self.eviction_max_age = max_age;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if the settings are inconsistent.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        if self.factory.is_none() && self.port_range.is_empty() {
            return Err(ConfigError::InvalidPortRange(format!(
                "{}-{}",
                self.port_range.start, self.port_range.end
            ))
            .into());
        }
        if self.service_settings.startup_tries == 0 {
            return Err(Error::InvalidRequest(
                "service startup tries must be at least 1".to_string(),
            ));
        }

        let factory: Arc<dyn RunnerFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(ProcessRunnerFactory::new(
                self.runner_settings,
                PortPool::new(self.port_range),
            )),
        };

        Ok(EngineRuntimeConfig {
            run_dir: self.run_dir,
            factory,
            service_settings: self.service_settings,
            eviction_interval: self.eviction_interval,
            eviction_max_age: self.eviction_max_age,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    run_dir: PathBuf,
    factory: Arc<dyn RunnerFactory>,
    service_settings: ServiceSettings,
    eviction_interval: Duration,
    eviction_max_age: Duration,
}

impl EngineRuntimeConfig {
    /// Start the runtime: create the indices and spawn the eviction worker.
    pub async fn start(self) -> Result<EngineRuntime> {
        tokio::fs::create_dir_all(&self.run_dir).await?;

        let scripts = Arc::new(ObjCollection::new([AppKind::Python, AppKind::Streamlit]));
        let services = Arc::new(ObjCollection::new([AppKind::Service]));
        let repositories = Arc::new(RepositoryIndex::new(
            scripts,
            services,
            self.factory.clone(),
            self.service_settings,
            self.run_dir.clone(),
        ));

        let state = Arc::new(
            EngineHandlerState::new(repositories.clone(), self.factory.clone())
                .with_terminate_grace(self.service_settings.terminate_grace),
        );

        let eviction_worker = EvictionWorker::new(
            EvictionWorkerConfig {
                run_dir: self.run_dir.clone(),
                poll_interval: self.eviction_interval,
                max_age: self.eviction_max_age,
            },
            repositories.clone(),
        );
        let eviction_shutdown = eviction_worker.shutdown_handle();
        let eviction_handle = tokio::spawn(async move {
            eviction_worker.run().await;
        });

        info!(
            run_dir = %self.run_dir.display(),
            startup_tries = self.service_settings.startup_tries,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            eviction_handle,
            eviction_shutdown,
            state,
            repositories,
            terminate_grace: self.service_settings.terminate_grace,
        })
    }
}

/// A running engine that can be embedded in an application.
///
/// The runtime manages:
/// - the repository index and the script/service indices it feeds
/// - the eviction worker removing orphaned snapshots
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    eviction_handle: JoinHandle<()>,
    eviction_shutdown: Arc<Notify>,
    state: Arc<EngineHandlerState>,
    repositories: Arc<RepositoryIndex>,
    terminate_grace: Duration,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<EngineHandlerState> {
        &self.state
    }

    /// Get a reference to the repository index.
    pub fn repositories(&self) -> &Arc<RepositoryIndex> {
        &self.repositories
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the eviction worker, then terminates (killing on timeout) every
    /// running artifact. Services are retired so none of them restarts.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.eviction_shutdown.notify_one();
        if let Err(e) = self.eviction_handle.await {
            error!("Eviction worker task panicked: {}", e);
        }

        let services = self.repositories.services().all_objects();
        let scripts = self.repositories.scripts().all_objects();
        let service_stops = services
            .iter()
            .map(|s| stop_artifact(s.as_ref(), self.terminate_grace));
        let script_stops = scripts
            .iter()
            .map(|s| stop_artifact(s.as_ref(), self.terminate_grace));
        let (services_stopped, scripts_stopped) = tokio::join!(
            futures::future::join_all(service_stops),
            futures::future::join_all(script_stops)
        );
        let failures = services_stopped
            .into_iter()
            .chain(scripts_stopped)
            .filter(|stopped| !stopped)
            .count();

        if failures > 0 {
            warn!(failures, "Some artifacts failed to stop during shutdown");
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.eviction_handle.is_finished()
    }
}

async fn stop_artifact<T: Artifact>(artifact: &T, grace: Duration) -> bool {
    match artifact.retire(grace).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                name = %artifact.name(),
                version = %artifact.version(),
                error = %e,
                "Failed to stop artifact during shutdown"
            );
            false
        }
    }
}

/// Scripts and services whose process is alive.
pub fn running_artifacts(repositories: &RepositoryIndex) -> (Vec<Arc<Script>>, Vec<Arc<Service>>) {
    let scripts = repositories
        .scripts()
        .all_objects()
        .into_iter()
        .filter(|s| s.is_running())
        .collect();
    let services = repositories
        .services()
        .all_objects()
        .into_iter()
        .filter(|s| s.is_running())
        .collect();
    (scripts, services)
}

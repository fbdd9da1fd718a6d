// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-demand scripts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Artifact, RunOverrides, build_request, is_stop_timeout};
use crate::error::{Error, Result};
use crate::manifest::{AppDeclaration, AppKind};
use crate::release::Release;
use crate::repository::{OwnerId, RepositoryId};
use crate::runner::{Runner, RunnerStream};

/// Script lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    /// Not running.
    Inactive,
    /// Launch in progress.
    Starting,
    /// Process reported ready.
    Active,
}

#[derive(Debug)]
struct ScriptStatus {
    state: ScriptState,
    port: Option<u16>,
    exit_code: Option<i32>,
    generation: u64,
}

/// Serializable view of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSnapshot {
    /// App name.
    pub name: String,
    /// Release tag.
    pub version: String,
    /// Declared kind.
    #[serde(rename = "type")]
    pub kind: AppKind,
    /// Lifecycle state.
    pub state: ScriptState,
    /// Bound port while active.
    pub port: Option<u16>,
    /// Exit code of the last finished run.
    pub exit_code: Option<i32>,
    /// Repository id.
    pub repository_id: RepositoryId,
    /// True owner.
    pub owner_id: OwnerId,
    /// True owner's display name.
    pub owner_name: String,
    /// Receiver, for shared clones.
    pub shared_to: Option<OwnerId>,
    /// Release time.
    pub created_at: DateTime<Utc>,
    /// Declaration.
    pub config: AppDeclaration,
}

/// An on-demand artifact.
pub struct Script {
    name: String,
    release: Arc<Release>,
    config: AppDeclaration,
    runner: Arc<dyn Runner>,
    status: Arc<Mutex<ScriptStatus>>,
}

impl Script {
    /// Bind `runner` to app `name` of `release`.
    pub fn new(
        release: Arc<Release>,
        name: impl Into<String>,
        config: AppDeclaration,
        runner: Arc<dyn Runner>,
    ) -> Result<Arc<Self>> {
        runner.set_work_dir(release.disk_path().to_path_buf())?;
        Ok(Arc::new(Self {
            name: name.into(),
            release,
            config,
            runner,
            status: Arc::new(Mutex::new(ScriptStatus {
                state: ScriptState::Inactive,
                port: None,
                exit_code: None,
                generation: 0,
            })),
        }))
    }

    /// Declaration.
    pub fn config(&self) -> &AppDeclaration {
        &self.config
    }

    /// The bound runner.
    pub fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }

    /// Current state.
    pub fn state(&self) -> ScriptState {
        self.status.lock().state
    }

    /// Port bound by the running process.
    pub fn port(&self) -> Option<u16> {
        self.status.lock().port
    }

    /// Exit code of the last finished run.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.lock().exit_code
    }

    /// Interactive stream of the running process.
    pub fn streams(&self) -> Option<Arc<dyn RunnerStream>> {
        self.runner.streams()
    }

    /// Start the script.
    ///
    /// Fails with [`Error::AlreadyRunning`] while a previous run is alive.
    pub async fn run(&self, overrides: Option<RunOverrides>) -> Result<ScriptSnapshot> {
        let generation = {
            let mut status = self.status.lock();
            if status.state == ScriptState::Starting || self.runner.is_running() {
                return Err(Error::AlreadyRunning {
                    name: self.name.clone(),
                    version: self.version().to_string(),
                });
            }
            status.state = ScriptState::Starting;
            status.generation += 1;
            status.generation
        };

        let ready = match self.launch(overrides.as_ref()).await {
            Ok(ready) => ready,
            Err(e) => {
                self.status.lock().state = ScriptState::Inactive;
                return Err(e);
            }
        };

        {
            let mut status = self.status.lock();
            status.state = if ready {
                ScriptState::Active
            } else {
                ScriptState::Inactive
            };
            status.port = if ready { self.runner.port() } else { None };
        }

        info!(
            name = %self.name,
            version = %self.version(),
            owner_id = self.release.indexed_owner(),
            ready,
            "Script started"
        );

        self.watch_exit(generation);
        Ok(self.snapshot())
    }

    async fn launch(&self, overrides: Option<&RunOverrides>) -> Result<bool> {
        self.release.materialize().await?;
        let request = build_request(&self.config.config, overrides);
        Ok(self.runner.run(request).await?)
    }

    fn watch_exit(&self, generation: u64) {
        let runner = self.runner.clone();
        let status = self.status.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            match runner.wait().await {
                Ok(code) => {
                    let mut status = status.lock();
                    if status.generation == generation {
                        status.exit_code = Some(code);
                        status.port = None;
                        status.state = ScriptState::Inactive;
                    }
                    debug!(name = %name, exit_code = code, "Script exited");
                }
                Err(e) => warn!(name = %name, error = %e, "Failed to wait for script"),
            }
        });
    }

    /// Send a graceful stop request.
    ///
    /// A [`RunnerError::Timeout`](crate::runner::RunnerError::Timeout) is the
    /// caller's cue to call [`kill`](Self::kill).
    pub async fn terminate(&self, timeout: Option<Duration>) -> Result<i32> {
        Ok(self.runner.terminate(timeout).await?)
    }

    /// Send a forceful stop request.
    pub async fn kill(&self, timeout: Option<Duration>) -> Result<i32> {
        Ok(self.runner.kill(timeout).await?)
    }

    /// Terminate, escalating to kill after `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<i32> {
        match self.terminate(Some(grace)).await {
            Err(e) if is_stop_timeout(&e) => {
                warn!(name = %self.name, version = %self.version(), "Terminate timed out, killing");
                self.kill(None).await
            }
            other => other,
        }
    }

    /// Serializable view.
    pub fn snapshot(&self) -> ScriptSnapshot {
        let status = self.status.lock();
        let repo = self.release.repository();
        ScriptSnapshot {
            name: self.name.clone(),
            version: self.release.tag().to_string(),
            kind: self.config.kind,
            state: status.state,
            port: status.port,
            exit_code: status.exit_code,
            repository_id: repo.id,
            owner_id: repo.owner_id,
            owner_name: repo.owner_name.clone(),
            shared_to: self.release.shared_to(),
            created_at: self.release.created_at(),
            config: self.config.clone(),
        }
    }
}

#[async_trait]
impl Artifact for Script {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AppKind {
        self.config.kind
    }

    fn release(&self) -> &Arc<Release> {
        &self.release
    }

    fn is_running(&self) -> bool {
        self.runner.is_running()
    }

    fn clone_to_shared(&self, owner: OwnerId) -> Result<Arc<Self>> {
        let release = Arc::new(self.release.clone_to_shared(owner));
        Script::new(
            release,
            self.name.clone(),
            self.config.clone(),
            self.runner.clone_fresh(),
        )
    }

    async fn retire(&self, grace: Duration) -> Result<()> {
        if self.runner.is_running() {
            self.stop(grace).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("version", &self.release.tag())
            .field("owner", &self.release.indexed_owner())
            .field("state", &self.state())
            .finish()
    }
}

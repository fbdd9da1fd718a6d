// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervised long-running services.
//!
//! Each service keeps two files next to its release snapshot:
//!
//! - `<name>.enabled`: JSON boolean. An enabled service starts when it is
//!   constructed and restarts whenever its process exits.
//! - `<name>.logs`: append-only log of supervisor events and process output,
//!   one `[YYYY/MM/DD, HH:MM:SS] [<tag>] <text>` line each (UTC).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::{Artifact, build_request, is_stop_timeout};
use crate::error::{Error, Result};
use crate::manifest::{AppDeclaration, AppKind};
use crate::release::Release;
use crate::repository::{OwnerId, RepositoryId};
use crate::runner::{Runner, stream_lines};

/// Block size used when reading logs backward.
pub const LOG_BLOCK_SIZE: usize = 8192;

/// Tag used for supervisor lines in service logs.
const SUPERVISOR_TAG: &str = "ServiceHandler";

/// Service lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Not running.
    Inactive,
    /// Launch attempts in progress.
    Starting,
    /// Process is up.
    Active,
    /// Every launch attempt failed.
    FailedToStart,
}

/// Supervision parameters.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    /// Launch attempts before giving up.
    pub startup_tries: u32,
    /// Grace period before a stop escalates to kill.
    pub terminate_grace: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            startup_tries: 5,
            terminate_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct ServiceStatus {
    state: ServiceState,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    enabled: bool,
    retired: bool,
    generation: u64,
}

/// Serializable view of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    /// App name.
    pub name: String,
    /// Release tag.
    pub version: String,
    /// Lifecycle state.
    pub state: ServiceState,
    /// Persisted enabled flag.
    pub enabled: bool,
    /// Exit code of the last finished run.
    pub exit_code: Option<i32>,
    /// When the current process came up.
    pub started_at: Option<DateTime<Utc>>,
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

/// A supervised long-running artifact.
pub struct Service {
    name: String,
    release: Arc<Release>,
    config: AppDeclaration,
    runner: Arc<dyn Runner>,
    settings: ServiceSettings,
    log_path: PathBuf,
    enabled_path: PathBuf,
    status: Mutex<ServiceStatus>,
    launch: tokio::sync::Mutex<()>,
}

impl Service {
    /// Bind `runner` to app `name` of `release`.
    ///
    /// Reads the persisted enabled flag and starts the service in the
    /// background when it is set.
    pub fn new(
        release: Arc<Release>,
        name: impl Into<String>,
        config: AppDeclaration,
        runner: Arc<dyn Runner>,
        settings: ServiceSettings,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        runner.set_work_dir(release.disk_path().to_path_buf())?;
        let log_path = release.disk_path().join(format!("{}.logs", name));
        let enabled_path = release.disk_path().join(format!("{}.enabled", name));
        let enabled = read_enabled(&enabled_path);

        let service = Arc::new(Self {
            name,
            release,
            config,
            runner,
            settings,
            log_path,
            enabled_path,
            status: Mutex::new(ServiceStatus {
                state: ServiceState::Inactive,
                exit_code: None,
                started_at: None,
                enabled,
                retired: false,
                generation: 0,
            }),
            launch: tokio::sync::Mutex::new(()),
        });

        if enabled {
            info!(name = %service.name, version = %service.version(), "Autostarting enabled service");
            let starting = service.clone();
            tokio::spawn(async move {
                let name = starting.name.clone();
                if let Err(e) = starting.run_boxed().await {
                    warn!(name = %name, error = %e, "Autostart failed");
                }
            });
        }

        Ok(service)
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
    pub fn state(&self) -> ServiceState {
        self.status.lock().state
    }

    /// Persisted enabled flag.
    pub fn enabled(&self) -> bool {
        self.status.lock().enabled
    }

    /// Exit code of the last finished run.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.lock().exit_code
    }

    /// Log file path.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn run_boxed(self: Arc<Self>) -> BoxFuture<'static, Result<ServiceSnapshot>> {
        Box::pin(async move { self.run().await })
    }

    /// Start the service. A no-op while it is running.
    ///
    /// Tries up to the configured number of launches; when none reports ready
    /// the state becomes [`ServiceState::FailedToStart`] and
    /// [`Error::StartupFailed`] is returned.
    pub async fn run(self: &Arc<Self>) -> Result<ServiceSnapshot> {
        let _launch = self.launch.lock().await;

        if self.status.lock().retired {
            return Err(Error::InvalidRequest(format!(
                "service {}@{} has been removed",
                self.name,
                self.version()
            )));
        }

        self.release.materialize().await?;
        self.ensure_log_file().await?;

        if self.runner.is_running() {
            return Ok(self.snapshot());
        }

        let generation = {
            let mut status = self.status.lock();
            status.state = ServiceState::Starting;
            status.generation += 1;
            status.generation
        };
        self.write_log("Starting service...").await;

        let tries = self.settings.startup_tries.max(1);
        let mut ready = false;
        for attempt in 1..=tries {
            let request = build_request(&self.config.config, None);
            match self.runner.run(request).await {
                Ok(true) => {
                    ready = true;
                    break;
                }
                Ok(false) => {
                    self.write_log(&format!("Start attempt {}/{} failed", attempt, tries))
                        .await;
                    debug!(name = %self.name, attempt, "Service start attempt failed");
                }
                Err(e) => {
                    self.status.lock().state = ServiceState::Inactive;
                    self.write_log(&format!("Failed to launch process: {}", e)).await;
                    return Err(e.into());
                }
            }
        }

        if !ready {
            let exit_code = self.runner.wait().await.unwrap_or(-1);
            {
                let mut status = self.status.lock();
                status.state = ServiceState::FailedToStart;
                status.exit_code = Some(exit_code);
            }
            self.write_log(&format!("Failed to start process. exit-code: {}", exit_code))
                .await;
            error!(name = %self.name, version = %self.version(), tries, exit_code, "Service failed to start");
            return Err(Error::StartupFailed {
                name: self.name.clone(),
                version: self.version().to_string(),
                attempts: tries,
                exit_code,
            });
        }

        {
            let mut status = self.status.lock();
            status.state = ServiceState::Active;
            status.started_at = Some(Utc::now());
        }
        info!(
            name = %self.name,
            version = %self.version(),
            owner_id = self.release.indexed_owner(),
            "Service started"
        );

        self.spawn_exit_watcher(generation);
        self.spawn_log_pump();
        Ok(self.snapshot())
    }

    fn spawn_exit_watcher(self: &Arc<Self>, generation: u64) {
        let service = self.clone();
        tokio::spawn(async move {
            let exit_code = match service.runner.wait().await {
                Ok(code) => code,
                Err(e) => {
                    warn!(name = %service.name, error = %e, "Failed to wait for service");
                    return;
                }
            };

            let restart = {
                let mut status = service.status.lock();
                if status.generation != generation {
                    return;
                }
                status.exit_code = Some(exit_code);
                status.started_at = None;
                status.state = ServiceState::Inactive;
                status.enabled && !status.retired
            };

            service
                .write_log(&format!("Process exited with code: {}", exit_code))
                .await;
            info!(name = %service.name, exit_code, restart, "Service process exited");

            if restart {
                if let Err(e) = service.clone().run_boxed().await {
                    warn!(name = %service.name, error = %e, "Service restart failed");
                }
            }
        });
    }

    fn spawn_log_pump(&self) {
        let Some(stream) = self.runner.streams() else {
            return;
        };
        let log_path = self.log_path.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to open service log");
                    return;
                }
            };

            let mut lines = stream_lines(stream);
            while let Some(line) = lines.next().await {
                let text = String::from_utf8_lossy(&line);
                let entry = log_line(&name, text.trim_end_matches(['\r', '\n']));
                if let Err(e) = file.write_all(entry.as_bytes()).await {
                    warn!(name = %name, error = %e, "Failed to write service log");
                    return;
                }
                let _ = file.flush().await;
            }
            debug!(name = %name, "Service output stream ended");
        });
    }

    async fn ensure_log_file(&self) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        Ok(())
    }

    /// Append a supervisor line. Skipped while the log file does not exist.
    async fn write_log(&self, text: &str) {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .await;
        let mut file = match file {
            Ok(file) => file,
            Err(_) => return,
        };
        let entry = log_line(SUPERVISOR_TAG, text);
        if let Err(e) = file.write_all(entry.as_bytes()).await {
            warn!(name = %self.name, error = %e, "Failed to write service log");
        }
    }

    /// Persist the enabled flag, then start or stop accordingly.
    ///
    /// Newly enabled with `auto_start` starts a stopped service; newly
    /// disabled stops a running one.
    pub async fn set_enabled(self: &Arc<Self>, enabled: bool, auto_start: bool) -> Result<ServiceSnapshot> {
        self.release.materialize().await?;
        tokio::fs::write(&self.enabled_path, serde_json::to_vec(&enabled)?).await?;
        self.status.lock().enabled = enabled;
        info!(name = %self.name, version = %self.version(), enabled, "Service enabled flag changed");

        if enabled && auto_start && !self.runner.is_running() {
            return self.run().await;
        }
        if !enabled && self.runner.is_running() {
            self.stop(self.settings.terminate_grace).await?;
        }
        Ok(self.snapshot())
    }

    /// Stop (terminate, kill on timeout) and start again.
    pub async fn restart(self: &Arc<Self>) -> Result<ServiceSnapshot> {
        if !self.runner.is_running() {
            return self.run().await;
        }
        self.write_log("Restarting service...").await;
        self.stop(self.settings.terminate_grace).await?;
        self.run().await
    }

    /// Send a graceful stop request.
    ///
    /// An enabled service is restarted by its exit watcher.
    pub async fn terminate(&self, timeout: Option<Duration>) -> Result<i32> {
        let code = self.runner.terminate(timeout).await?;
        self.write_log("Service has been terminated").await;
        Ok(code)
    }

    /// Send a forceful stop request.
    pub async fn kill(&self, timeout: Option<Duration>) -> Result<i32> {
        let code = self.runner.kill(timeout).await?;
        self.write_log("Service has been killed").await;
        Ok(code)
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

    /// Up to `limit` most recent log lines, oldest first.
    pub async fn get_logs(&self, limit: usize) -> Result<Vec<String>> {
        let path = self.log_path.clone();
        let lines = tokio::task::spawn_blocking(move || tail_lines(&path, limit, LOG_BLOCK_SIZE))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        Ok(lines)
    }

    /// Serializable view.
    pub fn snapshot(&self) -> ServiceSnapshot {
        let status = self.status.lock();
        let repo = self.release.repository();
        ServiceSnapshot {
            name: self.name.clone(),
            version: self.release.tag().to_string(),
            state: status.state,
            enabled: status.enabled,
            exit_code: status.exit_code,
            started_at: status.started_at,
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
impl Artifact for Service {
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
        Service::new(
            release,
            self.name.clone(),
            self.config.clone(),
            self.runner.clone_fresh(),
            self.settings,
        )
    }

    async fn retire(&self, grace: Duration) -> Result<()> {
        self.status.lock().retired = true;
        // Waits for an in-flight launch so it cannot outlive the stop below.
        let _launch = self.launch.lock().await;
        if self.runner.is_running() {
            self.stop(grace).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("version", &self.release.tag())
            .field("owner", &self.release.indexed_owner())
            .field("state", &self.state())
            .finish()
    }
}

fn read_enabled(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(raw.trim()).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Invalid enabled flag, treating as disabled");
            false
        }),
        Err(_) => false,
    }
}

fn log_line(tag: &str, text: &str) -> String {
    format!(
        "[{}] [{}] {}\n",
        Utc::now().format("%Y/%m/%d, %H:%M:%S"),
        tag,
        text
    )
}

/// Last `limit` lines of a file, read backward in `block`-sized chunks.
fn tail_lines(path: &Path, limit: usize, block: usize) -> std::io::Result<Vec<String>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut pos = file.seek(SeekFrom::End(0))?;
    let mut tail: Vec<u8> = Vec::new();
    while pos > 0 {
        let step = (block as u64).min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let body = tail.strip_suffix(b"\n").unwrap_or(&tail);
        if body.iter().filter(|b| **b == b'\n').count() >= limit {
            break;
        }
    }

    let text = String::from_utf8_lossy(&tail);
    let lines: Vec<&str> = text.lines().collect();
    let skip = lines.len().saturating_sub(limit);
    Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine request handlers.
//!
//! Transport-agnostic entry points. Every request names the acting user and
//! carries their sharing grants; the grants are applied to the user's view
//! before the target is resolved.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::artifact::{
    Artifact, RELEASE_MODE_VAR, RunOverrides, Script, ScriptSnapshot, Service, ServiceSnapshot,
    is_stop_timeout,
};
use crate::collection::ObjCollection;
use crate::error::{Error, Result};
use crate::repository::OwnerId;
use crate::repository_index::RepositoryIndex;
use crate::runner::{RunRequest, Runner, RunnerError, RunnerFactory, RunnerStream};
use crate::sharing::{UserGrants, apply_grants};

/// Shared state for engine handlers.
pub struct EngineHandlerState {
    /// Repository registry, which also owns the script and service indices.
    pub repositories: Arc<RepositoryIndex>,
    /// Factory for ad-hoc shell runners.
    pub factory: Arc<dyn RunnerFactory>,
    /// When the engine started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Engine version string.
    pub version: String,
    /// Grace period used when a stop escalates to kill.
    pub terminate_grace: Duration,
}

impl EngineHandlerState {
    /// Create handler state.
    pub fn new(repositories: Arc<RepositoryIndex>, factory: Arc<dyn RunnerFactory>) -> Self {
        Self {
            repositories,
            factory,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            terminate_grace: Duration::from_secs(10),
        }
    }

    /// Set the grace period used when a stop escalates to kill.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Get the engine uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    fn scripts(&self) -> &ObjCollection<Script> {
        self.repositories.scripts()
    }

    fn services(&self) -> &ObjCollection<Service> {
        self.repositories.services()
    }
}

/// The acting user and their grants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Acting user.
    pub user_id: OwnerId,
    /// Sharing grants held by the user.
    #[serde(default)]
    pub grants: UserGrants,
}

/// An artifact in the caller's view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Acting user.
    pub caller: Caller,
    /// App name.
    pub name: String,
    /// Release tag or `latest`.
    pub version: String,
}

async fn refresh_view<T: Artifact>(collection: &ObjCollection<T>, caller: &Caller, grace: Duration) {
    let report = apply_grants(collection, caller.user_id, &caller.grants, grace).await;
    if report.added > 0 || report.removed > 0 {
        debug!(
            user_id = caller.user_id,
            added = report.added,
            removed = report.removed,
            "Applied sharing grants"
        );
    }
    for failure in report.failures {
        warn!(user_id = caller.user_id, error = %failure, "Sharing grant could not be applied");
    }
}

async fn resolve<T: Artifact>(collection: &ObjCollection<T>, target: &Target, grace: Duration) -> Result<Arc<T>> {
    refresh_view(collection, &target.caller, grace).await;
    collection
        .resolve(target.caller.user_id, &target.name, &target.version)
        .ok_or_else(|| Error::NotFound(format!("{}@{}", target.name, target.version)))
}

/// How to stop an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
    /// The artifact.
    pub target: Target,
    /// How long to wait for the exit, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Kill when a graceful stop times out.
    #[serde(default)]
    pub escalate: bool,
}

impl StopRequest {
    fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Result of a stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopResponse<S> {
    /// Exit code of the stopped process.
    pub exit_code: i32,
    /// Artifact after the stop.
    pub snapshot: S,
}

fn not_running(target: &Target) -> Error {
    Error::InvalidRequest(format!("{}@{} is not running", target.name, target.version))
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Whether the engine is serving.
    pub healthy: bool,
    /// Engine version.
    pub version: String,
    /// Uptime in milliseconds.
    pub uptime_ms: i64,
    /// Registered repositories.
    pub repositories: usize,
    /// Indexed scripts, clones included.
    pub scripts: usize,
    /// Indexed services, clones included.
    pub services: usize,
}

/// Handle health check request.
pub async fn handle_health_check(state: &EngineHandlerState) -> Result<HealthCheckResponse> {
    Ok(HealthCheckResponse {
        healthy: true,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        repositories: state.repositories.repositories().len(),
        scripts: state.scripts().len(),
        services: state.services().len(),
    })
}

// ============================================================================
// Listing
// ============================================================================

/// Everything visible to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListAppsResponse {
    /// Scripts, own and shared.
    pub scripts: Vec<ScriptSnapshot>,
    /// Services, own and shared.
    pub services: Vec<ServiceSnapshot>,
}

/// List the caller's view.
pub async fn handle_list_apps(state: &EngineHandlerState, caller: &Caller) -> Result<ListAppsResponse> {
    refresh_view(state.scripts(), caller, state.terminate_grace).await;
    refresh_view(state.services(), caller, state.terminate_grace).await;

    Ok(ListAppsResponse {
        scripts: state
            .scripts()
            .get_all_for_user(caller.user_id)
            .iter()
            .map(|s| s.snapshot())
            .collect(),
        services: state
            .services()
            .get_all_for_user(caller.user_id)
            .iter()
            .map(|s| s.snapshot())
            .collect(),
    })
}

// ============================================================================
// Scripts
// ============================================================================

/// Request to run a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunScriptRequest {
    /// The script.
    pub target: Target,
    /// Per-run overrides of the declared config.
    #[serde(default)]
    pub overrides: Option<RunOverrides>,
}

/// Handle run script request.
pub async fn handle_run_script(state: &EngineHandlerState, request: RunScriptRequest) -> Result<ScriptSnapshot> {
    let script = resolve(state.scripts(), &request.target, state.terminate_grace).await?;
    info!(
        user_id = request.target.caller.user_id,
        name = %script.name(),
        version = %script.version(),
        "Run script request received"
    );
    script.run(request.overrides).await
}

/// Handle terminate script request.
pub async fn handle_terminate_script(
    state: &EngineHandlerState,
    request: StopRequest,
) -> Result<StopResponse<ScriptSnapshot>> {
    let script = resolve(state.scripts(), &request.target, state.terminate_grace).await?;
    if !script.is_running() {
        return Err(not_running(&request.target));
    }

    let exit_code = match script.terminate(request.timeout()).await {
        Err(e) if request.escalate && is_stop_timeout(&e) => {
            warn!(name = %script.name(), version = %script.version(), "Terminate timed out, killing");
            script.kill(None).await?
        }
        other => other?,
    };
    Ok(StopResponse {
        exit_code,
        snapshot: script.snapshot(),
    })
}

/// Handle kill script request.
pub async fn handle_kill_script(
    state: &EngineHandlerState,
    request: StopRequest,
) -> Result<StopResponse<ScriptSnapshot>> {
    let script = resolve(state.scripts(), &request.target, state.terminate_grace).await?;
    if !script.is_running() {
        return Err(not_running(&request.target));
    }

    let exit_code = script.kill(request.timeout()).await?;
    Ok(StopResponse {
        exit_code,
        snapshot: script.snapshot(),
    })
}

/// Handle restart script request: stop if running, then run again.
pub async fn handle_restart_script(state: &EngineHandlerState, request: RunScriptRequest) -> Result<ScriptSnapshot> {
    let script = resolve(state.scripts(), &request.target, state.terminate_grace).await?;
    if script.is_running() {
        script.stop(state.terminate_grace).await?;
    }
    info!(name = %script.name(), version = %script.version(), "Restarting script");
    script.run(request.overrides).await
}

/// Duplex stream of a running script.
pub async fn handle_open_script_stream(state: &EngineHandlerState, target: &Target) -> Result<Arc<dyn RunnerStream>> {
    let script = resolve(state.scripts(), target, state.terminate_grace).await?;
    script.streams().ok_or(Error::Runner(RunnerError::NoStream))
}

// ============================================================================
// Services
// ============================================================================

/// Handle run service request. A no-op for a running service.
pub async fn handle_run_service(state: &EngineHandlerState, target: &Target) -> Result<ServiceSnapshot> {
    let service = resolve(state.services(), target, state.terminate_grace).await?;
    info!(
        user_id = target.caller.user_id,
        name = %service.name(),
        version = %service.version(),
        "Run service request received"
    );
    service.run().await
}

/// Handle terminate service request.
///
/// An enabled service restarts on its own after the stop.
pub async fn handle_terminate_service(
    state: &EngineHandlerState,
    request: StopRequest,
) -> Result<StopResponse<ServiceSnapshot>> {
    let service = resolve(state.services(), &request.target, state.terminate_grace).await?;
    if !service.is_running() {
        return Err(not_running(&request.target));
    }

    let exit_code = match service.terminate(request.timeout()).await {
        Err(e) if request.escalate && is_stop_timeout(&e) => service.kill(None).await?,
        other => other?,
    };
    Ok(StopResponse {
        exit_code,
        snapshot: service.snapshot(),
    })
}

/// Handle kill service request.
pub async fn handle_kill_service(
    state: &EngineHandlerState,
    request: StopRequest,
) -> Result<StopResponse<ServiceSnapshot>> {
    let service = resolve(state.services(), &request.target, state.terminate_grace).await?;
    if !service.is_running() {
        return Err(not_running(&request.target));
    }

    let exit_code = service.kill(request.timeout()).await?;
    Ok(StopResponse {
        exit_code,
        snapshot: service.snapshot(),
    })
}

/// Handle restart service request.
pub async fn handle_restart_service(state: &EngineHandlerState, target: &Target) -> Result<ServiceSnapshot> {
    let service = resolve(state.services(), target, state.terminate_grace).await?;
    service.restart().await
}

/// Request to change a service's enabled flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableServiceRequest {
    /// The service.
    pub target: Target,
    /// New flag.
    pub enabled: bool,
    /// Start the service when it becomes enabled.
    #[serde(default)]
    pub auto_start: bool,
}

/// Handle enable/disable service request.
pub async fn handle_set_service_enabled(
    state: &EngineHandlerState,
    request: EnableServiceRequest,
) -> Result<ServiceSnapshot> {
    let service = resolve(state.services(), &request.target, state.terminate_grace).await?;
    service.set_enabled(request.enabled, request.auto_start).await
}

/// Request for the tail of a service log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLogsRequest {
    /// The service.
    pub target: Target,
    /// Maximum number of lines.
    pub limit: usize,
}

/// Handle get service logs request.
pub async fn handle_get_service_logs(state: &EngineHandlerState, request: ServiceLogsRequest) -> Result<Vec<String>> {
    let service = resolve(state.services(), &request.target, state.terminate_grace).await?;
    service.get_logs(request.limit).await
}

// ============================================================================
// Shell sessions
// ============================================================================

/// An interactive interpreter in a release directory.
pub struct ShellSession {
    /// The session's runner. Terminate it to end the session.
    pub runner: Arc<dyn Runner>,
    /// Duplex stream to the interpreter.
    pub stream: Arc<dyn RunnerStream>,
}

/// Open an interactive interpreter inside the release of a script or
/// service visible to the caller.
pub async fn handle_open_shell(state: &EngineHandlerState, target: &Target) -> Result<ShellSession> {
    let release = match resolve(state.scripts(), target, state.terminate_grace).await {
        Ok(script) => script.release().clone(),
        Err(Error::NotFound(_)) => resolve(state.services(), target, state.terminate_grace)
            .await?
            .release()
            .clone(),
        Err(e) => return Err(e),
    };
    release.materialize().await?;

    let runner = state.factory.shell(release.disk_path().to_path_buf());
    let mut request = RunRequest::new(String::new());
    request
        .env
        .insert(RELEASE_MODE_VAR.to_string(), "true".to_string());
    if !runner.run(request).await? {
        return Err(Error::Runner(RunnerError::Spawn(
            "shell exited during startup".to_string(),
        )));
    }
    let stream = runner.streams().ok_or(Error::Runner(RunnerError::NoStream))?;
    info!(user_id = target.caller.user_id, tag = %release.tag(), "Opened shell session");
    Ok(ShellSession { runner, stream })
}

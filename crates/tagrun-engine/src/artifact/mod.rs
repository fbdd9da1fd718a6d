// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runnable artifacts: one declared app inside one release, bound to a runner.
//!
//! - [`Script`]: on-demand, `INACTIVE -> STARTING -> ACTIVE -> INACTIVE`.
//! - [`Service`]: supervised, persisted `enabled` flag, auto-restart and a log
//!   file next to the snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::manifest::{AppKind, RuntimeConfig};
use crate::release::Release;
use crate::repository::OwnerId;
use crate::runner::{RunRequest, RunnerError};

mod script;
mod service;

pub use script::{Script, ScriptSnapshot, ScriptState};
pub use service::{LOG_BLOCK_SIZE, Service, ServiceSettings, ServiceSnapshot, ServiceState};

/// Variable injected into every launched process.
pub const RELEASE_MODE_VAR: &str = "RELEASE_MODE";

/// Common surface the object index needs from an artifact.
#[async_trait]
pub trait Artifact: Send + Sync + Sized + 'static {
    /// Declared app name.
    fn name(&self) -> &str;

    /// Release tag.
    fn version(&self) -> &str {
        self.release().tag()
    }

    /// Declared kind.
    fn kind(&self) -> AppKind;

    /// Release the artifact belongs to.
    fn release(&self) -> &Arc<Release>;

    /// Whether the artifact's process is alive.
    fn is_running(&self) -> bool;

    /// Independent copy projected into `owner`'s index.
    fn clone_to_shared(&self, owner: OwnerId) -> Result<Arc<Self>>;

    /// Stop for good: no restart afterwards. Terminates, then kills after
    /// `grace`.
    async fn retire(&self, grace: Duration) -> Result<()>;
}

/// Per-run overrides of the declared runtime config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOverrides {
    /// Replaces the declared entry file.
    #[serde(default)]
    pub entry_file: Option<String>,
    /// Merged over the declared environment.
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    /// Replaces the declared arguments.
    #[serde(default)]
    pub cli_args: Option<Vec<String>>,
}

/// Build a run request from the declaration and optional overrides.
pub fn build_request(config: &RuntimeConfig, overrides: Option<&RunOverrides>) -> RunRequest {
    let mut env = config.env.clone();
    let mut request = RunRequest::new(config.entry_file.clone());
    request.cli_args = config.cli_args.clone();

    if let Some(overrides) = overrides {
        if let Some(entry_file) = &overrides.entry_file {
            request.entry_file = entry_file.clone();
        }
        if let Some(extra) = &overrides.env {
            env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(cli_args) = &overrides.cli_args {
            request.cli_args = cli_args.clone();
        }
    }

    env.insert(RELEASE_MODE_VAR.to_string(), "true".to_string());
    request.env = env;
    request
}

/// Whether an error means a graceful stop timed out.
pub fn is_stop_timeout(error: &Error) -> bool {
    matches!(error, Error::Runner(RunnerError::Timeout))
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for tagrun-engine.

use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::artifact::ServiceSettings;
use crate::runner::{RunnerSettings, StreamStrategy};

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for materialized releases
    pub run_dir: PathBuf,
    /// Root of the filesystem repositories served by the binary
    pub repos_root: PathBuf,
    /// Script sourced before every launch (virtualenv `activate`)
    pub venv_activator: Option<PathBuf>,
    /// Half-open port range handed to port-bound apps
    pub port_range: Range<u16>,
    /// Interpreter for python apps, services and shells
    pub python_bin: String,
    /// Web-app launcher
    pub streamlit_bin: String,
    /// Readiness delay for port-bound apps
    pub streamlit_warmup: Duration,
    /// Readiness delay for services
    pub service_warmup: Duration,
    /// Launch attempts before a service is marked failed
    pub service_startup_tries: u32,
    /// Grace period before a stop escalates to kill
    pub terminate_timeout: Duration,
    /// Default stream wiring for launched processes
    pub stream_strategy: StreamStrategy,
    /// How often orphaned snapshots are swept
    pub eviction_interval: Duration,
    /// Minimum age of an orphaned snapshot before removal
    pub eviction_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/tmp/tagrun"),
            repos_root: PathBuf::from(".data/repos"),
            venv_activator: None,
            port_range: 17001..17101,
            python_bin: "python".to_string(),
            streamlit_bin: "streamlit".to_string(),
            streamlit_warmup: Duration::from_millis(3000),
            service_warmup: Duration::from_millis(1000),
            service_startup_tries: 5,
            terminate_timeout: Duration::from_secs(10),
            stream_strategy: StreamStrategy::Pty,
            eviction_interval: Duration::from_secs(3600),
            eviction_max_age: Duration::from_secs(86400),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from `lookup`, falling back to defaults for unset
    /// variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let run_dir = lookup("TAGRUN_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.run_dir);
        let repos_root = lookup("TAGRUN_REPOS_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.repos_root);
        let venv_activator = lookup("TAGRUN_VENV_ACTIVATOR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let port_range = match lookup("TAGRUN_PORT_RANGE") {
            Some(raw) => parse_port_range(&raw)?,
            None => defaults.port_range,
        };

        let python_bin = lookup("TAGRUN_PYTHON_BIN").unwrap_or(defaults.python_bin);
        let streamlit_bin = lookup("TAGRUN_STREAMLIT_BIN").unwrap_or(defaults.streamlit_bin);

        let streamlit_warmup = parse_var(&lookup, "TAGRUN_STREAMLIT_WARMUP_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.streamlit_warmup);
        let service_warmup = parse_var(&lookup, "TAGRUN_SERVICE_WARMUP_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.service_warmup);
        let service_startup_tries = parse_var(&lookup, "TAGRUN_SERVICE_STARTUP_TRIES")?
            .unwrap_or(defaults.service_startup_tries);
        let terminate_timeout = parse_var(&lookup, "TAGRUN_TERMINATE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.terminate_timeout);
        let stream_strategy = parse_var(&lookup, "TAGRUN_STREAM_STRATEGY")?
            .unwrap_or(defaults.stream_strategy);
        let eviction_interval = parse_var(&lookup, "TAGRUN_EVICTION_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.eviction_interval);
        let eviction_max_age = parse_var(&lookup, "TAGRUN_EVICTION_MAX_AGE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.eviction_max_age);

        if service_startup_tries == 0 {
            return Err(ConfigError::Invalid {
                var: "TAGRUN_SERVICE_STARTUP_TRIES",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            run_dir,
            repos_root,
            venv_activator,
            port_range,
            python_bin,
            streamlit_bin,
            streamlit_warmup,
            service_warmup,
            service_startup_tries,
            terminate_timeout,
            stream_strategy,
            eviction_interval,
            eviction_max_age,
        })
    }

    /// Settings for the process runner factory.
    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            strategy: self.stream_strategy,
            activator: self.venv_activator.clone(),
            python_bin: self.python_bin.clone(),
            streamlit_bin: self.streamlit_bin.clone(),
            streamlit_warmup: self.streamlit_warmup,
            service_warmup: self.service_warmup,
            terminate_grace: self.terminate_timeout,
        }
    }

    /// Supervision settings for services.
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            startup_tries: self.service_startup_tries,
            terminate_grace: self.terminate_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(None),
    }
}

/// Parse `START-END` (end exclusive).
fn parse_port_range(raw: &str) -> Result<Range<u16>, ConfigError> {
    let invalid = || ConfigError::InvalidPortRange(raw.to_string());
    let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start == 0 || start >= end {
        return Err(invalid());
    }
    Ok(start..end)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable holds a value that cannot be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// The port range is malformed or empty.
    #[error("Invalid port range: {0:?} (expected START-END)")]
    InvalidPortRange(String),
}

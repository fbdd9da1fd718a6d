// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tagrun-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runner (process execution) failed.
    #[error("Runner error: {0}")]
    Runner(#[from] crate::runner::RunnerError),

    /// Repository capability failed.
    #[error("Repository error: {0}")]
    Repository(#[from] crate::repository::RepositoryError),

    /// App declaration could not be parsed.
    #[error("Manifest error: {0}")]
    Manifest(#[from] crate::manifest::ManifestError),

    /// A script was started while its process is still running.
    #[error("{name}@{version} is already running")]
    AlreadyRunning {
        /// Artifact name.
        name: String,
        /// Release tag.
        version: String,
    },

    /// A service exhausted its startup attempts.
    #[error("{name}@{version} failed to start after {attempts} attempts (exit code {exit_code})")]
    StartupFailed {
        /// Artifact name.
        name: String,
        /// Release tag.
        version: String,
        /// Attempts made.
        attempts: u32,
        /// Exit code of the last attempt.
        exit_code: i32,
    },

    /// Checking out a release snapshot failed. The release stays
    /// unmaterialized and is retried on next access.
    #[error("Failed to materialize release {tag}: {reason}")]
    Materialization {
        /// Release tag.
        tag: String,
        /// Underlying failure.
        reason: String,
    },

    /// Another repository already publishes an app with this name.
    #[error("App name '{0}' is already used by another repository")]
    NameUnavailable(String),

    /// Lookup found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// One or more release hooks failed.
    #[error("Release hook failed: {0}")]
    Hook(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner trait definitions.
//!
//! Defines the abstract interface for process runners and their I/O streams.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors from runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// The port pool has no free port left.
    #[error("No free ports available in range {start}..{end}")]
    PortsExhausted {
        /// First port of the configured range.
        start: u16,
        /// End (exclusive) of the configured range.
        end: u16,
    },

    /// Operation is not valid in the runner's current state.
    #[error("Invalid runner state: {0}")]
    InvalidState(String),

    /// No process has ever been started by this runner.
    #[error("Runner has not started a process")]
    NotStarted,

    /// Waiting for the process exceeded the caller's timeout.
    ///
    /// The stop signal has already been delivered; the caller decides whether
    /// to escalate.
    #[error("Timed out waiting for process exit")]
    Timeout,

    /// The runner's execution strategy does not expose a stream.
    #[error("Process has no attached stream")]
    NoStream,

    /// The process could not be spawned.
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// Terminal setup or signal delivery failed.
    #[error("System call failed: {0}")]
    Sys(#[from] nix::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStrategy {
    /// Master/slave pseudo-terminal pair; stdout and stderr share the terminal.
    #[default]
    Pty,
    /// Byte-stream pipes; stderr is merged into stdout.
    Pipe,
    /// All streams go to `/dev/null`.
    Null,
}

impl std::fmt::Display for StreamStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStrategy::Pty => write!(f, "pty"),
            StreamStrategy::Pipe => write!(f, "pipe"),
            StreamStrategy::Null => write!(f, "null"),
        }
    }
}

impl std::str::FromStr for StreamStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pty" | "pseudo_terminal" => Ok(StreamStrategy::Pty),
            "pipe" => Ok(StreamStrategy::Pipe),
            "null" | "devnull" => Ok(StreamStrategy::Null),
            _ => Err(format!("Unknown stream strategy: {}", s)),
        }
    }
}

/// Lifecycle of a runner.
///
/// ```text
/// IDLE -> STARTING -> RUNNING -> (TERMINATING | KILLING) -> EXITED -> IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    /// No process, ready to run.
    Idle,
    /// A process is being spawned.
    Starting,
    /// A process is alive.
    Running,
    /// A graceful stop was requested.
    Terminating,
    /// A forceful stop was requested.
    Killing,
    /// The process exited and has been reaped.
    Exited,
}

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Entry file relative to the working directory.
    pub entry_file: String,
    /// Environment variables added to the child's environment.
    pub env: BTreeMap<String, String>,
    /// Arguments passed after the entry file.
    pub cli_args: Vec<String>,
}

impl RunRequest {
    /// Create a request for an entry file with no env or arguments.
    pub fn new(entry_file: impl Into<String>) -> Self {
        Self {
            entry_file: entry_file.into(),
            ..Default::default()
        }
    }
}

/// Bidirectional byte stream attached to a running process.
#[async_trait]
pub trait RunnerStream: Send + Sync {
    /// Read up to `n` bytes. An empty result means EOF.
    async fn read(&self, n: usize) -> Result<Vec<u8>>;

    /// Read one newline-terminated line (newline included). Empty means EOF.
    async fn readline(&self) -> Result<Vec<u8>>;

    /// Write raw bytes.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Write bytes followed by a line terminator.
    async fn writeline(&self, data: &[u8]) -> Result<()>;

    /// Close the write side. A no-op where the transport has no EOF notion.
    async fn write_eof(&self) -> Result<()>;
}

/// Trait for process runners.
///
/// A runner supervises at most one OS process at a time and may be reused
/// once the previous process has exited.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Runner type identifier (e.g., "python", "streamlit", "shell")
    fn runner_type(&self) -> &'static str;

    /// Start a process. Returns whether it reported ready.
    ///
    /// A still-running previous process is terminated first (killed if it
    /// does not exit within the grace period).
    async fn run(&self, request: RunRequest) -> Result<bool>;

    /// Send a graceful stop request and wait for the exit code.
    ///
    /// With a timeout, [`RunnerError::Timeout`] tells the caller to escalate
    /// to [`kill`](Runner::kill).
    async fn terminate(&self, timeout: Option<Duration>) -> Result<i32>;

    /// Send a forceful stop request and wait for the exit code.
    async fn kill(&self, timeout: Option<Duration>) -> Result<i32>;

    /// Wait for the current (or last) process to exit.
    ///
    /// Any number of callers may wait concurrently; each observes the same
    /// exit code.
    async fn wait(&self) -> Result<i32>;

    /// Whether a process is currently alive.
    fn is_running(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> RunnerState;

    /// Port bound by the current process, if its kind requires one.
    fn port(&self) -> Option<u16> {
        None
    }

    /// Stream of the current process, if the execution strategy provides one.
    fn streams(&self) -> Option<Arc<dyn RunnerStream>>;

    /// Working directory used for the next launch.
    fn work_dir(&self) -> PathBuf;

    /// Change the working directory. Fails while a process is running.
    fn set_work_dir(&self, dir: PathBuf) -> Result<()>;

    /// Fresh, never-run runner with the same construction parameters.
    fn clone_fresh(&self) -> Arc<dyn Runner>;
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launch profiles: how each kind of process is started and when it counts
//! as ready.

use std::path::PathBuf;
use std::time::Duration;

use super::traits::RunRequest;

/// Which command line a runner builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchKind {
    /// `python -u <entry> <args>`
    Python,
    /// `streamlit run <entry> --server.port <port> --server.headless true -- <args>`
    Streamlit,
    /// Interactive interpreter, no entry file.
    Shell,
}

impl LaunchKind {
    /// Identifier used in logs and [`Runner::runner_type`](super::Runner::runner_type).
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchKind::Python => "python",
            LaunchKind::Streamlit => "streamlit",
            LaunchKind::Shell => "shell",
        }
    }

    /// Whether the launch needs a port from the pool.
    pub fn needs_port(&self) -> bool {
        matches!(self, LaunchKind::Streamlit)
    }
}

/// When a freshly spawned process is considered ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as the spawn succeeds.
    Immediate,
    /// Ready if the process is still alive after the delay.
    WarmUp(Duration),
}

/// Everything needed to build a command line for a launch kind.
#[derive(Debug, Clone)]
pub struct LaunchProfile {
    /// Command-line shape.
    pub kind: LaunchKind,
    /// Readiness policy.
    pub readiness: Readiness,
    /// Script sourced before launching (e.g. a virtualenv `activate`).
    pub activator: Option<PathBuf>,
    /// Interpreter binary.
    pub python_bin: String,
    /// Web-app launcher binary.
    pub streamlit_bin: String,
}

impl LaunchProfile {
    /// Build the `sh -c` script for a request.
    ///
    /// Environment variables are passed through the process environment, not
    /// the script. Output of stderr is folded into stdout.
    pub fn shell_script(&self, request: &RunRequest, port: Option<u16>) -> String {
        let mut script = String::new();
        if let Some(activator) = &self.activator {
            script.push_str(". ");
            script.push_str(&shell_quote(&activator.to_string_lossy()));
            script.push_str("; ");
        }
        script.push_str("exec ");

        let args = request
            .cli_args
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");

        match self.kind {
            LaunchKind::Python => {
                script.push_str(&shell_quote(&self.python_bin));
                script.push_str(" -u ");
                script.push_str(&shell_quote(&request.entry_file));
                if !args.is_empty() {
                    script.push(' ');
                    script.push_str(&args);
                }
            }
            LaunchKind::Streamlit => {
                script.push_str(&shell_quote(&self.streamlit_bin));
                script.push_str(" run ");
                script.push_str(&shell_quote(&request.entry_file));
                if let Some(port) = port {
                    script.push_str(&format!(" --server.port {}", port));
                }
                script.push_str(" --server.headless true --");
                if !args.is_empty() {
                    script.push(' ');
                    script.push_str(&args);
                }
            }
            LaunchKind::Shell => {
                script.push_str(&shell_quote(&self.python_bin));
            }
        }

        script.push_str(" 2>&1");
        script
    }
}

/// Single-quote a word for `sh`.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagrun Engine - Release Runner Orchestration
//!
//! This crate turns tagged snapshots of user repositories into runnable
//! artifacts and supervises them as OS processes on a single host. It
//! materializes releases on disk, launches scripts and services with retry
//! and escalating termination, pools ports for web apps, and indexes every
//! artifact per owner with a cross-tenant sharing overlay.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Transport layer (external)                        │
//! │                 HTTP / WebSocket, auth, webhook glue                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ handlers::handle_*
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        tagrun-engine (This Crate)                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Repository  │─▶│   Release   │─▶│   Object    │  │  Eviction   │     │
//! │  │   Index     │  │    Sets     │  │  Indices    │  │   Worker    │     │
//! │  └─────────────┘  └─────────────┘  └──────┬──────┘  └─────────────┘     │
//! │                                           │ Script / Service            │
//! │                                           ▼                             │
//! │                  ┌─────────────┐   ┌─────────────┐                      │
//! │                  │  Port Pool  │◀──│   Process   │                      │
//! │                  └─────────────┘   │   Runners   │                      │
//! │                                    └──────┬──────┘                      │
//! └───────────────────────────────────────────┼─────────────────────────────┘
//!                                             │ sh -c (pty / pipe / null)
//!                                             ▼
//!                                 ┌─────────────────────────┐
//!                                 │   python / streamlit    │
//!                                 │   child processes       │
//!                                 └─────────────────────────┘
//! ```
//!
//! # Artifact State Machines
//!
//! ```text
//!   Script                          Service
//!
//!  ┌──────────┐                   ┌──────────┐
//!  │ INACTIVE │◀─────┐            │ INACTIVE │◀───────────────┐
//!  └────┬─────┘      │            └────┬─────┘                │
//!    run│            │ exit         run│  ▲ enabled: re-run   │ exit
//!       ▼            │                 ▼  │                   │
//!  ┌──────────┐      │            ┌──────────┐  5 failures  ┌─┴────────┐
//!  │ STARTING │──────┤ not ready  │ STARTING │─────────────▶│  FAILED  │
//!  └────┬─────┘      │            └────┬─────┘              │ TO START │
//!  ready│            │            ready│                    └──────────┘
//!       ▼            │                 ▼
//!  ┌──────────┐      │            ┌──────────┐
//!  │  ACTIVE  │──────┘            │  ACTIVE  │
//!  └──────────┘                   └──────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `handle_run_script` | Run a script with optional entry/env/args overrides |
//! | `handle_terminate_script` / `handle_kill_script` | Stop a script, optionally escalating |
//! | `handle_restart_script` | Stop if running, then run again |
//! | `handle_run_service` / `handle_restart_service` | Start or bounce a service |
//! | `handle_set_service_enabled` | Persist the enabled flag, start or stop accordingly |
//! | `handle_get_service_logs` | Tail of a service log |
//! | `handle_list_apps` | A user's view, sharing grants applied |
//! | `handle_open_script_stream` / `handle_open_shell` | Interactive I/O |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TAGRUN_RUN_DIR` | `/tmp/tagrun` | Root for materialized releases |
//! | `TAGRUN_REPOS_ROOT` | `.data/repos` | Repositories served by the binary |
//! | `TAGRUN_VENV_ACTIVATOR` | - | Script sourced before every launch |
//! | `TAGRUN_PORT_RANGE` | `17001-17101` | Ports for web apps (end exclusive) |
//! | `TAGRUN_PYTHON_BIN` | `python` | Interpreter |
//! | `TAGRUN_STREAMLIT_BIN` | `streamlit` | Web-app launcher |
//! | `TAGRUN_STREAMLIT_WARMUP_MS` | `3000` | Readiness delay for web apps |
//! | `TAGRUN_SERVICE_WARMUP_MS` | `1000` | Readiness delay for services |
//! | `TAGRUN_SERVICE_STARTUP_TRIES` | `5` | Service launch attempts |
//! | `TAGRUN_TERMINATE_TIMEOUT_SECS` | `10` | Grace period before kill |
//! | `TAGRUN_STREAM_STRATEGY` | `pty` | `pty`, `pipe` or `null` |
//! | `TAGRUN_EVICTION_INTERVAL_SECS` | `3600` | Orphan snapshot sweep interval |
//! | `TAGRUN_EVICTION_MAX_AGE_SECS` | `86400` | Minimum orphan age before removal |
//!
//! # Modules
//!
//! - [`artifact`]: Scripts and services
//! - [`collection`]: Per-owner artifact index
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types
//! - [`handlers`]: Transport-facing request handlers
//! - [`manifest`]: `appconfig.yml` parsing
//! - [`release`]: Release snapshots and release sets
//! - [`repository`]: Repository capability and filesystem source
//! - [`repository_index`]: Repository registry feeding the indices
//! - [`runner`]: Process execution backends
//! - [`sharing`]: Cross-tenant grant overlay

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Declaration file (`appconfig.yml`) parsing.
pub mod manifest;

/// Repository capability and the filesystem-backed source.
pub mod repository;

/// Versioned release snapshots and per-repository release sets.
pub mod release;

/// Process execution backends, port pool and runner factories.
pub mod runner;

/// Scripts and services bound to runners.
pub mod artifact;

/// Multi-tenant artifact index.
pub mod collection;

/// Cross-tenant sharing overlay.
pub mod sharing;

/// Repository registry fanning release events into the indices.
pub mod repository_index;

/// Transport-facing request handlers.
pub mod handlers;

/// Background worker for evicting orphaned release snapshots.
pub mod eviction_worker;

/// Embeddable runtime for tagrun-engine.
pub mod runtime;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::Error;

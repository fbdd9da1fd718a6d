// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner module - process execution backends.
//!
//! A [`Runner`] supervises one OS process at a time. [`ProcessRunner`] is the
//! real implementation; [`MockRunner`] simulates lifecycles for tests.

mod factory;
mod launch;
pub mod mock;
mod port_pool;
mod process;
mod stream;
mod traits;

pub use factory::{ProcessRunnerFactory, RunnerFactory, RunnerSettings};
pub use launch::{LaunchKind, LaunchProfile, Readiness, shell_quote};
pub use mock::{MockRunner, MockRunnerFactory};
pub use port_pool::PortPool;
pub use process::{DEFAULT_TERMINATE_GRACE, ProcessRunner};
pub use stream::{PipeStream, PtyStream, READ_CHUNK, stream_lines, stream_read};
pub use traits::*;

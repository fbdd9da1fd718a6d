// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner for testing.
//!
//! A simple runner implementation that simulates process lifecycles
//! without actually spawning anything.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::factory::RunnerFactory;
use super::traits::*;
use crate::manifest::AppKind;

/// Exit code reported for a simulated graceful stop.
pub const MOCK_TERMINATED: i32 = -15;
/// Exit code reported for a simulated forceful stop.
pub const MOCK_KILLED: i32 = -9;

#[derive(Debug)]
struct MockProcess {
    generation: u64,
    exit: watch::Sender<Option<i32>>,
}

#[derive(Debug, Default)]
struct MockState {
    work_dir: PathBuf,
    state: Option<RunnerState>,
    generation: u64,
    current: Option<MockProcess>,
    runs: Vec<RunRequest>,
}

/// Mock runner for testing.
pub struct MockRunner {
    inner: Arc<Mutex<MockState>>,
    /// How long a started process lives before exiting with code 0 (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, processes exit with code 1 immediately and report not ready
    pub fail_by_default: bool,
    /// If true, processes stay running until stopped or [`MockRunner::exit`] is called.
    pub never_complete: bool,
    /// If true, graceful stop requests are ignored.
    pub ignore_terminate: bool,
    /// Port reported while a process is alive.
    pub port: Option<u16>,
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRunner {
    /// Create a new mock runner.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockState::default())),
            execution_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
            ignore_terminate: false,
            port: None,
        }
    }

    /// Create a mock runner whose processes never become ready.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock runner whose processes stay up until explicitly stopped.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Let processes live for `ms` milliseconds before exiting with code 0.
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.execution_delay_ms = ms;
        self
    }

    /// Report `port` while a process is alive.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Ignore graceful stop requests.
    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    /// Requests passed to [`Runner::run`], oldest first.
    pub fn runs(&self) -> Vec<RunRequest> {
        self.inner.lock().runs.clone()
    }

    /// Make the current process exit with `code`.
    pub fn exit(&self, code: i32) {
        finish(&self.inner, None, code);
    }

    fn fresh(&self, work_dir: PathBuf) -> MockRunner {
        MockRunner {
            inner: Arc::new(Mutex::new(MockState {
                work_dir,
                ..Default::default()
            })),
            execution_delay_ms: self.execution_delay_ms,
            fail_by_default: self.fail_by_default,
            never_complete: self.never_complete,
            ignore_terminate: self.ignore_terminate,
            port: self.port,
        }
    }

    fn alive(&self) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|p| p.exit.borrow().is_none())
    }

    async fn stop(&self, code: i32, state: RunnerState, timeout: Option<Duration>) -> Result<i32> {
        if self.inner.lock().current.is_none() {
            return Err(RunnerError::NotStarted);
        }
        if self.alive() {
            self.inner.lock().state = Some(state);
            if !(self.ignore_terminate && code == MOCK_TERMINATED) {
                self.exit(code);
            }
        }
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait())
                .await
                .map_err(|_| RunnerError::Timeout)?,
            None => self.wait().await,
        }
    }
}

/// Publish an exit code for the current process, or only for `generation`.
fn finish(inner: &Mutex<MockState>, generation: Option<u64>, code: i32) {
    let mut state = inner.lock();
    let Some(process) = state.current.as_ref() else {
        return;
    };
    if generation.is_some_and(|g| g != process.generation) || process.exit.borrow().is_some() {
        return;
    }
    process.exit.send_replace(Some(code));
    state.state = Some(RunnerState::Exited);
}

#[async_trait]
impl Runner for MockRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, request: RunRequest) -> Result<bool> {
        if self.alive() {
            self.exit(MOCK_TERMINATED);
        }

        let generation = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            let (exit, _) = watch::channel(None);
            inner.current = Some(MockProcess {
                generation: inner.generation,
                exit,
            });
            inner.state = Some(RunnerState::Running);
            inner.runs.push(request);
            inner.generation
        };

        if self.fail_by_default {
            finish(&self.inner, Some(generation), 1);
            return Ok(false);
        }

        if !self.never_complete {
            let inner = self.inner.clone();
            let delay = self.execution_delay_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finish(&inner, Some(generation), 0);
            });
        }

        Ok(true)
    }

    async fn terminate(&self, timeout: Option<Duration>) -> Result<i32> {
        self.stop(MOCK_TERMINATED, RunnerState::Terminating, timeout)
            .await
    }

    async fn kill(&self, timeout: Option<Duration>) -> Result<i32> {
        self.stop(MOCK_KILLED, RunnerState::Killing, timeout).await
    }

    async fn wait(&self) -> Result<i32> {
        let (mut exit, generation) = {
            let inner = self.inner.lock();
            let process = inner.current.as_ref().ok_or(RunnerError::NotStarted)?;
            (process.exit.subscribe(), process.generation)
        };
        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RunnerError::NotStarted)?
            .unwrap_or(-1);

        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == Some(RunnerState::Exited) {
            inner.state = Some(RunnerState::Idle);
        }
        Ok(code)
    }

    fn is_running(&self) -> bool {
        self.alive()
    }

    fn state(&self) -> RunnerState {
        self.inner.lock().state.unwrap_or(RunnerState::Idle)
    }

    fn port(&self) -> Option<u16> {
        if self.alive() { self.port } else { None }
    }

    fn streams(&self) -> Option<Arc<dyn RunnerStream>> {
        None
    }

    fn work_dir(&self) -> PathBuf {
        self.inner.lock().work_dir.clone()
    }

    fn set_work_dir(&self, dir: PathBuf) -> Result<()> {
        if self.alive() {
            return Err(RunnerError::InvalidState(
                "cannot change working directory while running".to_string(),
            ));
        }
        self.inner.lock().work_dir = dir;
        Ok(())
    }

    fn clone_fresh(&self) -> Arc<dyn Runner> {
        Arc::new(self.fresh(self.work_dir()))
    }
}

/// Factory handing out [`MockRunner`]s shaped like a prototype.
///
/// Every runner created is kept so tests can drive it.
pub struct MockRunnerFactory {
    prototype: MockRunner,
    created: Mutex<Vec<(AppKind, Arc<MockRunner>)>>,
}

impl MockRunnerFactory {
    /// Create a factory; port-bound kinds get ports counting up from 17001.
    pub fn new(prototype: MockRunner) -> Self {
        Self {
            prototype,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Runners created so far, oldest first.
    pub fn created(&self) -> Vec<(AppKind, Arc<MockRunner>)> {
        self.created.lock().clone()
    }
}

impl RunnerFactory for MockRunnerFactory {
    fn for_app(&self, kind: AppKind, work_dir: PathBuf) -> Option<Arc<dyn Runner>> {
        if kind == AppKind::Unknown {
            return None;
        }
        let mut created = self.created.lock();
        let mut runner = self.prototype.fresh(work_dir);
        if kind == AppKind::Streamlit {
            runner.port = Some(17001 + created.len() as u16);
        }
        let runner = Arc::new(runner);
        created.push((kind, runner.clone()));
        Some(runner)
    }

    fn shell(&self, work_dir: PathBuf) -> Arc<dyn Runner> {
        Arc::new(self.prototype.fresh(work_dir))
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OS process runner.
//!
//! Spawns one child at a time through `sh -c` in the runner's working
//! directory. A reaper task owns the child: it awaits the exit, closes the
//! terminal slave, returns the port to the pool and publishes the exit code on
//! a watch channel so every waiter observes it.

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::launch::{LaunchProfile, Readiness};
use super::port_pool::PortPool;
use super::stream::{PipeStream, PtyStream};
use super::traits::{
    Result, RunRequest, Runner, RunnerError, RunnerState, RunnerStream, StreamStrategy,
};

/// Default grace period before a re-run escalates from terminate to kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct ProcessSlot {
    generation: u64,
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    stream: Option<Arc<dyn RunnerStream>>,
    port: Option<u16>,
}

impl ProcessSlot {
    fn is_alive(&self) -> bool {
        self.exit.borrow().is_none()
    }
}

struct Inner {
    work_dir: PathBuf,
    state: RunnerState,
    generation: u64,
    current: Option<ProcessSlot>,
}

/// Runner that launches real OS processes.
pub struct ProcessRunner {
    profile: LaunchProfile,
    strategy: StreamStrategy,
    ports: Option<PortPool>,
    terminate_grace: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl ProcessRunner {
    /// Create a runner.
    ///
    /// `ports` is required for launch kinds that bind a port.
    pub fn new(
        profile: LaunchProfile,
        strategy: StreamStrategy,
        ports: Option<PortPool>,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            profile,
            strategy,
            ports,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            inner: Arc::new(Mutex::new(Inner {
                work_dir,
                state: RunnerState::Idle,
                generation: 0,
                current: None,
            })),
        }
    }

    /// Set the grace period used when a re-run has to stop the old process.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Execution strategy of this runner.
    pub fn strategy(&self) -> StreamStrategy {
        self.strategy
    }

    /// PID of the live process, if any.
    pub fn pid(&self) -> Option<u32> {
        let inner = self.inner.lock();
        inner
            .current
            .as_ref()
            .filter(|slot| slot.is_alive())
            .map(|slot| slot.pid)
    }

    fn live_slot(&self) -> Option<ProcessSlot> {
        self.inner
            .lock()
            .current
            .as_ref()
            .filter(|slot| slot.is_alive())
            .cloned()
    }

    fn acquire_port(&self) -> Result<Option<u16>> {
        if !self.profile.kind.needs_port() {
            return Ok(None);
        }
        let pool = self.ports.as_ref().ok_or_else(|| {
            RunnerError::InvalidState(format!(
                "{} runner has no port pool",
                self.profile.kind.as_str()
            ))
        })?;
        Ok(Some(pool.acquire()?))
    }

    fn release_port(&self, port: Option<u16>) {
        if let (Some(pool), Some(port)) = (&self.ports, port) {
            pool.release(port);
        }
    }

    async fn signal(&self, signal: Signal, state: RunnerState) -> Result<()> {
        let Some(slot) = self.live_slot() else {
            return Ok(());
        };
        {
            let mut inner = self.inner.lock();
            if inner.generation == slot.generation {
                inner.state = state;
            }
        }
        match killpg(Pid::from_raw(slot.pid as i32), signal) {
            Ok(()) => {
                debug!(pid = slot.pid, signal = %signal, "Signalled process group");
                Ok(())
            }
            // Already gone; the reaper publishes the exit code.
            Err(nix::Error::ESRCH) => Ok(()),
            Err(e) => Err(RunnerError::Sys(e)),
        }
    }

    async fn stop_with(
        &self,
        signal: Signal,
        state: RunnerState,
        timeout: Option<Duration>,
    ) -> Result<i32> {
        if self.inner.lock().current.is_none() {
            return Err(RunnerError::NotStarted);
        }
        self.signal(signal, state).await?;
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait())
                .await
                .map_err(|_| RunnerError::Timeout)?,
            None => self.wait().await,
        }
    }

    async fn stop_previous(&self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        info!(runner = self.profile.kind.as_str(), "Stopping previous process before re-run");
        match self.terminate(Some(self.terminate_grace)).await {
            Ok(_) => Ok(()),
            Err(RunnerError::Timeout) => {
                warn!("Previous process ignored terminate, killing");
                self.kill(None).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn(
        &self,
        request: &RunRequest,
        work_dir: &Path,
        port: Option<u16>,
        generation: u64,
    ) -> Result<ProcessSlot> {
        let script = self.profile.shell_script(request, port);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&script)
            .current_dir(work_dir)
            .envs(&request.env)
            .process_group(0);

        let mut terminal: Option<(OwnedFd, OwnedFd)> = None;
        match self.strategy {
            StreamStrategy::Null => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            StreamStrategy::Pipe => {
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null());
            }
            StreamStrategy::Pty => {
                let (master, slave) = open_terminal()?;
                cmd.stdin(Stdio::from(slave.try_clone()?))
                    .stdout(Stdio::from(slave.try_clone()?))
                    .stderr(Stdio::from(slave.try_clone()?));
                terminal = Some((master, slave));
            }
        }

        debug!(
            work_dir = %work_dir.display(),
            script = %script,
            strategy = %self.strategy,
            "Spawning process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {}", script, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| RunnerError::Spawn("process exited before its pid was read".to_string()))?;

        let (stream, slave): (Option<Arc<dyn RunnerStream>>, Option<OwnedFd>) = match terminal {
            Some((master, slave)) => (Some(Arc::new(PtyStream::new(File::from(master)))), Some(slave)),
            None => match (child.stdout.take(), child.stdin.take()) {
                (Some(stdout), Some(stdin)) => (Some(Arc::new(PipeStream::new(stdout, stdin))), None),
                _ => (None, None),
            },
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let inner = self.inner.clone();
        let ports = self.ports.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .unwrap_or_else(|| -status.signal().unwrap_or(0)),
                Err(e) => {
                    error!(pid, error = %e, "Failed to wait for process");
                    -1
                }
            };
            // Closing the slave lets terminal readers observe EOF.
            drop(slave);
            if let (Some(pool), Some(port)) = (ports, port) {
                pool.release(port);
            }
            {
                let mut inner = inner.lock();
                if inner.generation == generation {
                    inner.state = RunnerState::Exited;
                }
            }
            exit_tx.send_replace(Some(code));
            debug!(pid, exit_code = code, "Process reaped");
        });

        Ok(ProcessSlot {
            generation,
            pid,
            exit: exit_rx,
            stream,
            port,
        })
    }
}

/// Open a pseudo-terminal with signal-generating keys disabled on both ends.
fn open_terminal() -> Result<(OwnedFd, OwnedFd)> {
    let pty = nix::pty::openpty(None, None)?;
    disable_signal_keys(&pty.slave)?;
    disable_signal_keys(&pty.master)?;
    Ok((pty.master, pty.slave))
}

fn disable_signal_keys(fd: &OwnedFd) -> Result<()> {
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.local_flags.remove(LocalFlags::ISIG);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

#[async_trait]
impl Runner for ProcessRunner {
    fn runner_type(&self) -> &'static str {
        self.profile.kind.as_str()
    }

    async fn run(&self, request: RunRequest) -> Result<bool> {
        self.stop_previous().await?;

        let (work_dir, generation) = {
            let mut inner = self.inner.lock();
            inner.generation += 1;
            inner.state = RunnerState::Starting;
            (inner.work_dir.clone(), inner.generation)
        };

        let port = match self.acquire_port() {
            Ok(port) => port,
            Err(e) => {
                self.inner.lock().state = RunnerState::Idle;
                return Err(e);
            }
        };

        let slot = match self.spawn(&request, &work_dir, port, generation) {
            Ok(slot) => slot,
            Err(e) => {
                self.release_port(port);
                self.inner.lock().state = RunnerState::Idle;
                error!(error = %e, entry_file = %request.entry_file, "Failed to start process");
                return Err(e);
            }
        };

        let mut exit = slot.exit.clone();
        {
            let mut inner = self.inner.lock();
            if slot.is_alive() {
                inner.state = RunnerState::Running;
            }
            inner.current = Some(slot.clone());
        }

        info!(
            runner = self.profile.kind.as_str(),
            pid = slot.pid,
            port = ?port,
            entry_file = %request.entry_file,
            "Process started"
        );

        let ready = match self.profile.readiness {
            Readiness::Immediate => true,
            Readiness::WarmUp(delay) => {
                // Exit during warm-up ends the wait early.
                let _ = tokio::time::timeout(delay, exit.wait_for(|code| code.is_some())).await;
                exit.borrow().is_none()
            }
        };

        if !ready {
            warn!(pid = slot.pid, "Process exited during warm-up");
        }
        Ok(ready)
    }

    async fn terminate(&self, timeout: Option<Duration>) -> Result<i32> {
        self.stop_with(Signal::SIGTERM, RunnerState::Terminating, timeout)
            .await
    }

    async fn kill(&self, timeout: Option<Duration>) -> Result<i32> {
        self.stop_with(Signal::SIGKILL, RunnerState::Killing, timeout)
            .await
    }

    async fn wait(&self) -> Result<i32> {
        let (mut exit, generation) = {
            let inner = self.inner.lock();
            let slot = inner.current.as_ref().ok_or(RunnerError::NotStarted)?;
            (slot.exit.clone(), slot.generation)
        };

        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| RunnerError::Io(std::io::Error::other("process reaper vanished")))?
            .unwrap_or(-1);

        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == RunnerState::Exited {
            inner.state = RunnerState::Idle;
        }
        Ok(code)
    }

    fn is_running(&self) -> bool {
        self.live_slot().is_some()
    }

    fn state(&self) -> RunnerState {
        self.inner.lock().state
    }

    fn port(&self) -> Option<u16> {
        self.live_slot().and_then(|slot| slot.port)
    }

    fn streams(&self) -> Option<Arc<dyn RunnerStream>> {
        self.live_slot().and_then(|slot| slot.stream)
    }

    fn work_dir(&self) -> PathBuf {
        self.inner.lock().work_dir.clone()
    }

    fn set_work_dir(&self, dir: PathBuf) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.current.as_ref().is_some_and(|slot| slot.is_alive()) {
            return Err(RunnerError::InvalidState(
                "cannot change working directory while running".to_string(),
            ));
        }
        inner.work_dir = dir;
        Ok(())
    }

    fn clone_fresh(&self) -> Arc<dyn Runner> {
        Arc::new(
            ProcessRunner::new(
                self.profile.clone(),
                self.strategy,
                self.ports.clone(),
                self.work_dir(),
            )
            .with_terminate_grace(self.terminate_grace),
        )
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner construction per application kind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::launch::{LaunchKind, LaunchProfile, Readiness};
use super::port_pool::PortPool;
use super::process::{DEFAULT_TERMINATE_GRACE, ProcessRunner};
use super::traits::{Runner, StreamStrategy};
use crate::manifest::AppKind;

/// Creates runners for declared applications.
pub trait RunnerFactory: Send + Sync {
    /// Runner for an application of `kind` working in `work_dir`.
    ///
    /// Returns `None` for kinds that cannot be launched.
    fn for_app(&self, kind: AppKind, work_dir: PathBuf) -> Option<Arc<dyn Runner>>;

    /// Runner for an interactive interpreter session.
    fn shell(&self, work_dir: PathBuf) -> Arc<dyn Runner>;
}

/// Settings shared by every runner a [`ProcessRunnerFactory`] creates.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Default stream wiring.
    pub strategy: StreamStrategy,
    /// Script sourced before every launch.
    pub activator: Option<PathBuf>,
    /// Interpreter binary.
    pub python_bin: String,
    /// Web-app launcher binary.
    pub streamlit_bin: String,
    /// Readiness delay for port-bound web apps.
    pub streamlit_warmup: Duration,
    /// Readiness delay for services.
    pub service_warmup: Duration,
    /// Grace period before a re-run kills the old process.
    pub terminate_grace: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            strategy: StreamStrategy::Pty,
            activator: None,
            python_bin: "python".to_string(),
            streamlit_bin: "streamlit".to_string(),
            streamlit_warmup: Duration::from_secs(3),
            service_warmup: Duration::from_secs(1),
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }
}

/// Factory for [`ProcessRunner`]s sharing one port pool and activator.
#[derive(Debug, Clone)]
pub struct ProcessRunnerFactory {
    settings: RunnerSettings,
    ports: PortPool,
}

impl ProcessRunnerFactory {
    /// Create a factory.
    pub fn new(settings: RunnerSettings, ports: PortPool) -> Self {
        Self { settings, ports }
    }

    /// The shared port pool.
    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    fn profile(&self, kind: LaunchKind, readiness: Readiness) -> LaunchProfile {
        LaunchProfile {
            kind,
            readiness,
            activator: self.settings.activator.clone(),
            python_bin: self.settings.python_bin.clone(),
            streamlit_bin: self.settings.streamlit_bin.clone(),
        }
    }

    fn build(&self, profile: LaunchProfile, work_dir: PathBuf) -> ProcessRunner {
        let ports = profile.kind.needs_port().then(|| self.ports.clone());
        ProcessRunner::new(profile, self.settings.strategy, ports, work_dir)
            .with_terminate_grace(self.settings.terminate_grace)
    }

    /// Plain interpreter runner, ready as soon as it spawns.
    pub fn create_python_runner(&self, work_dir: PathBuf) -> ProcessRunner {
        self.build(
            self.profile(LaunchKind::Python, Readiness::Immediate),
            work_dir,
        )
    }

    /// Port-bound web-app runner with warm-up readiness.
    pub fn create_streamlit_runner(&self, work_dir: PathBuf) -> ProcessRunner {
        self.build(
            self.profile(
                LaunchKind::Streamlit,
                Readiness::WarmUp(self.settings.streamlit_warmup),
            ),
            work_dir,
        )
    }

    /// Interpreter runner for services; alive after the warm-up means ready.
    pub fn create_service_runner(&self, work_dir: PathBuf) -> ProcessRunner {
        self.build(
            self.profile(
                LaunchKind::Python,
                Readiness::WarmUp(self.settings.service_warmup),
            ),
            work_dir,
        )
    }

    /// Interactive interpreter session.
    pub fn create_shell_runner(&self, work_dir: PathBuf) -> ProcessRunner {
        self.build(self.profile(LaunchKind::Shell, Readiness::Immediate), work_dir)
    }
}

impl RunnerFactory for ProcessRunnerFactory {
    fn for_app(&self, kind: AppKind, work_dir: PathBuf) -> Option<Arc<dyn Runner>> {
        let runner = match kind {
            AppKind::Python => self.create_python_runner(work_dir),
            AppKind::Streamlit => self.create_streamlit_runner(work_dir),
            AppKind::Service => self.create_service_runner(work_dir),
            AppKind::Unknown => return None,
        };
        Some(Arc::new(runner))
    }

    fn shell(&self, work_dir: PathBuf) -> Arc<dyn Runner> {
        Arc::new(self.create_shell_runner(work_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ProcessRunnerFactory {
        ProcessRunnerFactory::new(RunnerSettings::default(), PortPool::new(17001..17003))
    }

    #[test]
    fn test_for_app_selects_runner_type() {
        let factory = factory();
        let dir = PathBuf::from("/srv/app");

        let python = factory.for_app(AppKind::Python, dir.clone()).unwrap();
        assert_eq!(python.runner_type(), "python");
        assert_eq!(python.work_dir(), dir);

        let web = factory.for_app(AppKind::Streamlit, dir.clone()).unwrap();
        assert_eq!(web.runner_type(), "streamlit");

        let service = factory.for_app(AppKind::Service, dir.clone()).unwrap();
        assert_eq!(service.runner_type(), "python");

        assert!(factory.for_app(AppKind::Unknown, dir).is_none());
    }

    #[test]
    fn test_shell_runner_uses_shell_launch() {
        let runner = factory().shell(PathBuf::from("/tmp"));
        assert_eq!(runner.runner_type(), "shell");
        assert!(!runner.is_running());
    }

    #[test]
    fn test_only_web_apps_get_the_pool() {
        let factory = factory();
        let runner = factory.create_python_runner(PathBuf::from("/tmp"));
        assert_eq!(runner.strategy(), StreamStrategy::Pty);
        assert_eq!(factory.ports().available(), 2);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tagrun-engine integration tests.
//!
//! Provides TestContext for laying out repositories on disk and running an
//! engine over them.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tagrun_engine::artifact::ServiceSettings;
use tagrun_engine::handlers::{Caller, EngineHandlerState, Target};
use tagrun_engine::repository_index::RepositoryIndex;
use tagrun_engine::runner::{MockRunner, MockRunnerFactory, RunnerFactory, RunnerSettings};
use tagrun_engine::runtime::{EngineRuntime, EngineRuntimeBuilder};
use tagrun_engine::sharing::UserGrants;

/// Declaration with one script, one web app and one service.
pub const MANIFEST: &str = "apps:
  report:
    type: python
    config:
      entry_file: main.py
      env: {MODE: full}
  dash:
    type: streamlit
    config: {entry_file: app.py}
  worker:
    type: service
    config: {entry_file: worker.py}
";

/// Grace period used for every stop in tests.
pub const GRACE: Duration = Duration::from_millis(200);

/// Test context that owns the temp directory and a running engine.
pub struct TestContext {
    pub runtime: EngineRuntime,
    pub repos_root: PathBuf,
    pub run_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Engine over an empty repository tree using `factory` for runners.
    pub async fn with_factory(factory: Arc<dyn RunnerFactory>) -> Self {
        Self::build(|builder| builder.factory(factory)).await
    }

    /// Engine spawning real processes through `sh`.
    pub async fn with_processes(settings: RunnerSettings) -> Self {
        Self::build(|builder| builder.runner_settings(settings).port_range(17901..17911)).await
    }

    async fn build(configure: impl FnOnce(EngineRuntimeBuilder) -> EngineRuntimeBuilder) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let repos_root = temp_dir.path().join("repos");
        let run_dir = temp_dir.path().join("run");
        std::fs::create_dir_all(&repos_root).expect("Failed to create repos root");

        let builder = EngineRuntime::builder()
            .run_dir(&run_dir)
            .service_settings(ServiceSettings {
                startup_tries: 3,
                terminate_grace: GRACE,
            });
        let runtime = configure(builder)
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        Self {
            runtime,
            repos_root,
            run_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn state(&self) -> &EngineHandlerState {
        self.runtime.state()
    }

    pub fn index(&self) -> &Arc<RepositoryIndex> {
        self.runtime.repositories()
    }

    /// Directory of `tag` in the source tree of `owner/repo`.
    pub fn tag_dir(&self, owner: u64, repo: &str, tag: &str) -> PathBuf {
        self.repos_root.join(owner.to_string()).join(repo).join(tag)
    }

    /// Write a tag with an `appconfig.yml` and extra files.
    pub fn write_tag(&self, owner: u64, repo: &str, tag: &str, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.tag_dir(owner, repo, tag);
        std::fs::create_dir_all(&dir).expect("Failed to create tag dir");
        std::fs::write(dir.join("appconfig.yml"), manifest).expect("Failed to write manifest");
        for (name, content) in files {
            std::fs::write(dir.join(name), content).expect("Failed to write file");
        }
        dir
    }

    /// Open every repository written so far.
    pub async fn open_tree(&self) {
        let failures = self
            .index()
            .open_directory_tree(&self.repos_root)
            .await
            .expect("Failed to open repository tree");
        assert!(failures.is_empty(), "unexpected failures: {:?}", failures);
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("Failed to shut down");
    }
}

/// Mock factory whose runners stay up until stopped.
pub fn long_running_factory() -> Arc<MockRunnerFactory> {
    Arc::new(MockRunnerFactory::new(MockRunner::never_completing()))
}

pub fn caller(user_id: u64) -> Caller {
    Caller {
        user_id,
        grants: UserGrants::default(),
    }
}

pub fn caller_with_grants(user_id: u64, releases: &[&str], from_users: &[u64]) -> Caller {
    Caller {
        user_id,
        grants: UserGrants {
            allowed_releases: releases.iter().map(|s| s.to_string()).collect(),
            allowed_from_users: from_users.iter().copied().collect(),
        },
    }
}

pub fn target(caller: Caller, name: &str, version: &str) -> Target {
    Target {
        caller,
        name: name.to_string(),
        version: version.to_string(),
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

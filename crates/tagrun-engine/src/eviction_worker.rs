// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for evicting orphaned release snapshots.
//!
//! Snapshots live at `{RUN_DIR}/{owner_id}/{repo_name}/{tag}/`. A snapshot is
//! orphaned when no registered release or shared clone claims its path, for
//! example after a grant was withdrawn or the host restarted with fewer
//! repositories. Orphans older than the configured age are removed, along
//! with owner and repository directories left empty.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::repository_index::RepositoryIndex;

/// Configuration for the eviction worker.
#[derive(Debug, Clone)]
pub struct EvictionWorkerConfig {
    /// Directory holding release snapshots.
    pub run_dir: PathBuf,
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Minimum age of an orphaned snapshot before it is removed.
    pub max_age: Duration,
}

impl Default for EvictionWorkerConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/tmp/tagrun"),
            poll_interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Sweep statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    /// Snapshots removed.
    pub evicted: u64,
    /// Entries that could not be inspected or removed.
    pub errors: u64,
}

/// Background worker that removes orphaned snapshots.
pub struct EvictionWorker {
    config: EvictionWorkerConfig,
    index: Arc<RepositoryIndex>,
    shutdown: Arc<Notify>,
}

impl EvictionWorker {
    /// Create a new eviction worker over the snapshots claimed by `index`.
    pub fn new(config: EvictionWorkerConfig, index: Arc<RepositoryIndex>) -> Self {
        Self {
            config,
            index,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            run_dir = %self.config.run_dir.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_hours = self.config.max_age.as_secs() / 3600,
            "Eviction worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Eviction worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to evict orphaned snapshots");
                    }
                }
            }
        }

        info!("Eviction worker stopped");
    }

    /// Remove every orphaned snapshot older than the configured age.
    pub async fn sweep(&self) -> std::io::Result<EvictionStats> {
        let claimed = self.index.claimed_paths();
        let mut stats = EvictionStats::default();

        let owners = match list_dirs(&self.config.run_dir).await {
            Ok(owners) => owners,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Run directory does not exist, nothing to evict");
                return Ok(stats);
            }
            Err(e) => return Err(e),
        };

        for owner in owners {
            let repos = match list_dirs(&owner).await {
                Ok(repos) => repos,
                Err(e) => {
                    warn!(path = %owner.display(), error = %e, "Failed to read owner directory");
                    stats.errors += 1;
                    continue;
                }
            };
            for repo in repos {
                self.sweep_repo(&repo, &claimed, &mut stats).await;
                remove_if_empty(&repo).await;
            }
            remove_if_empty(&owner).await;
        }

        if stats.evicted > 0 || stats.errors > 0 {
            info!(evicted = stats.evicted, errors = stats.errors, "Eviction cycle completed");
        } else {
            debug!("Eviction cycle completed, no orphaned snapshots found");
        }
        Ok(stats)
    }

    async fn sweep_repo(&self, repo: &Path, claimed: &BTreeSet<PathBuf>, stats: &mut EvictionStats) {
        let snapshots = match list_dirs(repo).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(path = %repo.display(), error = %e, "Failed to read repository directory");
                stats.errors += 1;
                return;
            }
        };

        for snapshot in snapshots {
            if claimed.contains(&snapshot) {
                continue;
            }

            let age = match tokio::fs::metadata(&snapshot)
                .await
                .and_then(|m| m.modified())
                .map(|t| t.elapsed().unwrap_or_default())
            {
                Ok(age) => age,
                Err(e) => {
                    debug!(path = %snapshot.display(), error = %e, "Failed to get snapshot age");
                    stats.errors += 1;
                    continue;
                }
            };
            if age < self.config.max_age {
                continue;
            }

            match tokio::fs::remove_dir_all(&snapshot).await {
                Ok(()) => {
                    debug!(
                        path = %snapshot.display(),
                        age_hours = age.as_secs() / 3600,
                        "Evicted orphaned snapshot"
                    );
                    stats.evicted += 1;
                }
                Err(e) => {
                    warn!(path = %snapshot.display(), error = %e, "Failed to evict snapshot");
                    stats.errors += 1;
                }
            }
        }
    }
}

async fn list_dirs(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn remove_if_empty(path: &Path) {
    // Fails with ENOTEMPTY for directories still in use.
    let _ = tokio::fs::remove_dir(path).await;
}

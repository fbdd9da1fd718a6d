// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Releases: versioned snapshots of a repository at one tag.
//!
//! A release's snapshot lives at
//! `<run_dir>/<shared_to or owner_id>/<repository name>/<tag>` and is checked
//! out lazily by [`Release::materialize`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::manifest::AppDeclaration;
use crate::repository::{OwnerId, RepositoryInfo, RepositorySource};

/// A versioned snapshot of a repository.
pub struct Release {
    repo: RepositoryInfo,
    tag: String,
    created_at: DateTime<Utc>,
    shared_to: Option<OwnerId>,
    apps: Arc<BTreeMap<String, AppDeclaration>>,
    source: Arc<dyn RepositorySource>,
    run_dir: PathBuf,
    disk_path: PathBuf,
    checkout: tokio::sync::Mutex<()>,
}

impl Release {
    /// Create a release owned by the repository's owner.
    pub fn new(
        repo: RepositoryInfo,
        tag: String,
        created_at: DateTime<Utc>,
        apps: BTreeMap<String, AppDeclaration>,
        source: Arc<dyn RepositorySource>,
        run_dir: PathBuf,
    ) -> Self {
        Self::build(repo, tag, created_at, Arc::new(apps), source, run_dir, None)
    }

    fn build(
        repo: RepositoryInfo,
        tag: String,
        created_at: DateTime<Utc>,
        apps: Arc<BTreeMap<String, AppDeclaration>>,
        source: Arc<dyn RepositorySource>,
        run_dir: PathBuf,
        shared_to: Option<OwnerId>,
    ) -> Self {
        let disk_path = run_dir
            .join(shared_to.unwrap_or(repo.owner_id).to_string())
            .join(&repo.name)
            .join(&tag);
        Self {
            repo,
            tag,
            created_at,
            shared_to,
            apps,
            source,
            run_dir,
            disk_path,
            checkout: tokio::sync::Mutex::new(()),
        }
    }

    /// Tag this release was built from.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Time of the tagged commit.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Repository identity.
    pub fn repository(&self) -> &RepositoryInfo {
        &self.repo
    }

    /// True owner (the repository owner).
    pub fn owner_id(&self) -> OwnerId {
        self.repo.owner_id
    }

    /// User this release was shared to, if it is a shared clone.
    pub fn shared_to(&self) -> Option<OwnerId> {
        self.shared_to
    }

    /// Owner under which artifacts of this release are indexed.
    pub fn indexed_owner(&self) -> OwnerId {
        self.shared_to.unwrap_or(self.repo.owner_id)
    }

    /// Whether this is a projection into another user's index.
    pub fn is_shared(&self) -> bool {
        self.indexed_owner() != self.repo.owner_id
    }

    /// Declared applications.
    pub fn apps(&self) -> &BTreeMap<String, AppDeclaration> {
        &self.apps
    }

    /// Snapshot directory.
    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    /// Whether the snapshot exists on disk.
    pub fn is_materialized(&self) -> bool {
        self.disk_path.exists()
    }

    /// Check out the snapshot if it is not on disk yet.
    ///
    /// Returns whether a checkout happened. A failed checkout leaves nothing
    /// behind so the next call retries.
    pub async fn materialize(&self) -> Result<bool> {
        let _guard = self.checkout.lock().await;
        if tokio::fs::try_exists(&self.disk_path).await? {
            return Ok(false);
        }
        if let Some(parent) = self.disk_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(
            repo = %self.repo.name,
            tag = %self.tag,
            path = %self.disk_path.display(),
            "Materializing release"
        );

        if let Err(e) = self.source.materialize_tag(&self.tag, &self.disk_path).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&self.disk_path).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %self.disk_path.display(), error = %cleanup, "Failed to remove partial snapshot");
            }
            error!(repo = %self.repo.name, tag = %self.tag, error = %e, "Failed to materialize release");
            return Err(Error::Materialization {
                tag: self.tag.clone(),
                reason: e.to_string(),
            });
        }

        info!(repo = %self.repo.name, tag = %self.tag, "Release materialized");
        Ok(true)
    }

    /// Delete the snapshot from disk.
    pub async fn evict(&self) -> Result<()> {
        let _guard = self.checkout.lock().await;
        match tokio::fs::remove_dir_all(&self.disk_path).await {
            Ok(()) => {
                info!(path = %self.disk_path.display(), "Evicted release snapshot");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Same tag and apps, projected into `owner`'s index with its own snapshot.
    pub fn clone_to_shared(&self, owner: OwnerId) -> Release {
        Self::build(
            self.repo.clone(),
            self.tag.clone(),
            self.created_at,
            self.apps.clone(),
            self.source.clone(),
            self.run_dir.clone(),
            Some(owner),
        )
    }
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("repo", &self.repo.name)
            .field("tag", &self.tag)
            .field("shared_to", &self.shared_to)
            .field("disk_path", &self.disk_path)
            .finish()
    }
}

/// Callback fired when a release is added to or removed from a set.
pub type ReleaseHook = Arc<dyn Fn(&RepositoryInfo, &Arc<Release>) -> Result<()> + Send + Sync>;

/// Outcome of a release set mutation.
#[derive(Debug, Default)]
pub struct HookReport {
    /// Whether the set changed.
    pub applied: bool,
    /// Errors reported by hooks (and eviction, on delete).
    pub failures: Vec<Error>,
}

/// Releases of one repository keyed by tag.
pub struct ReleaseSet {
    repo: RepositoryInfo,
    releases: Mutex<BTreeMap<String, Arc<Release>>>,
    created_hooks: Mutex<Vec<ReleaseHook>>,
    deleted_hooks: Mutex<Vec<ReleaseHook>>,
}

impl ReleaseSet {
    /// Empty set for `repo`.
    pub fn new(repo: RepositoryInfo) -> Self {
        Self {
            repo,
            releases: Mutex::new(BTreeMap::new()),
            created_hooks: Mutex::new(Vec::new()),
            deleted_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a hook fired after a release is inserted.
    pub fn add_created_hook(&self, hook: ReleaseHook) {
        self.created_hooks.lock().push(hook);
    }

    /// Register a hook fired after a release is removed.
    pub fn add_deleted_hook(&self, hook: ReleaseHook) {
        self.deleted_hooks.lock().push(hook);
    }

    /// Insert a release unless its tag is already present.
    pub fn new_release(&self, release: Arc<Release>) -> HookReport {
        {
            let mut releases = self.releases.lock();
            if releases.contains_key(release.tag()) {
                return HookReport::default();
            }
            releases.insert(release.tag().to_string(), release.clone());
        }
        info!(repo = %self.repo.name, tag = %release.tag(), "New release");

        let hooks = self.created_hooks.lock().clone();
        HookReport {
            applied: true,
            failures: self.fire(&hooks, &release),
        }
    }

    /// Remove a release, fire the deleted hooks, then evict its snapshot.
    pub async fn delete_release(&self, tag: &str) -> HookReport {
        let Some(release) = self.releases.lock().remove(tag) else {
            return HookReport::default();
        };
        info!(repo = %self.repo.name, tag, "Deleting release");

        let hooks = self.deleted_hooks.lock().clone();
        let mut failures = self.fire(&hooks, &release);
        if let Err(e) = release.evict().await {
            warn!(repo = %self.repo.name, tag, error = %e, "Failed to evict release");
            failures.push(e);
        }
        HookReport {
            applied: true,
            failures,
        }
    }

    fn fire(&self, hooks: &[ReleaseHook], release: &Arc<Release>) -> Vec<Error> {
        hooks
            .iter()
            .filter_map(|hook| match hook(&self.repo, release) {
                Ok(()) => None,
                Err(e) => {
                    warn!(repo = %self.repo.name, tag = %release.tag(), error = %e, "Release hook failed");
                    Some(e)
                }
            })
            .collect()
    }

    /// Release for `tag`.
    pub fn get(&self, tag: &str) -> Option<Arc<Release>> {
        self.releases.lock().get(tag).cloned()
    }

    /// Known tags in order.
    pub fn tags(&self) -> Vec<String> {
        self.releases.lock().keys().cloned().collect()
    }

    /// All releases in tag order.
    pub fn list(&self) -> Vec<Arc<Release>> {
        self.releases.lock().values().cloned().collect()
    }

    /// Number of releases.
    pub fn len(&self) -> usize {
        self.releases.lock().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.releases.lock().is_empty()
    }
}

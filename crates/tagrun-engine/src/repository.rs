// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repositories and the source-control capability they wrap.
//!
//! The engine never talks to source control directly. A [`RepositorySource`]
//! lists tags, checks out a tagged snapshot, reads single files at a tag and
//! deletes tags. [`FsRepositorySource`] implements it over plain directories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::manifest::{MANIFEST_FILE, Manifest};
use crate::release::{HookReport, Release, ReleaseSet};

/// Identifier of a user (owner of repositories or receiver of shares).
pub type OwnerId = u64;

/// Identifier of a repository.
pub type RepositoryId = u64;

/// Repository capability errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The tag does not exist.
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other failure reported by the backend.
    #[error("{0}")]
    Other(String),
}

/// Result type for repository capability operations.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// A tag and the time of the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    /// Tag name.
    pub name: String,
    /// Commit time; orders releases for "latest" lookups.
    pub created_at: DateTime<Utc>,
}

/// Source-control operations the engine consumes.
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Write the file tree of `tag` into `dest` (which does not exist yet).
    async fn materialize_tag(&self, tag: &str, dest: &Path) -> RepositoryResult<()>;

    /// All tags of the repository.
    async fn list_tags(&self) -> RepositoryResult<Vec<TagInfo>>;

    /// Delete a tag.
    async fn delete_tag(&self, tag: &str) -> RepositoryResult<()>;

    /// Contents of `path` at `tag`, or `None` if the file does not exist.
    async fn read_file_at_tag(&self, tag: &str, path: &str) -> RepositoryResult<Option<Vec<u8>>>;
}

/// Identity of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    /// Repository id.
    pub id: RepositoryId,
    /// Repository name.
    pub name: String,
    /// Owning user.
    pub owner_id: OwnerId,
    /// Owning user's display name.
    pub owner_name: String,
}

/// Whether a tag should become a release.
///
/// Tags ending in `uc` (case-insensitive) mark unconfigured snapshots.
pub fn is_configured_tag(tag: &str) -> bool {
    !tag.to_lowercase().ends_with("uc")
}

/// A repository with its releases.
pub struct Repository {
    info: RepositoryInfo,
    source: Arc<dyn RepositorySource>,
    run_dir: PathBuf,
    releases: ReleaseSet,
}

impl Repository {
    /// Create a repository with no releases. Call [`sync_tags`](Self::sync_tags)
    /// to load them.
    pub fn new(info: RepositoryInfo, source: Arc<dyn RepositorySource>, run_dir: PathBuf) -> Self {
        let releases = ReleaseSet::new(info.clone());
        Self {
            info,
            source,
            run_dir,
            releases,
        }
    }

    /// Repository identity.
    pub fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    /// Repository id.
    pub fn id(&self) -> RepositoryId {
        self.info.id
    }

    /// Repository name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Owning user.
    pub fn owner_id(&self) -> OwnerId {
        self.info.owner_id
    }

    /// The repository's releases.
    pub fn releases(&self) -> &ReleaseSet {
        &self.releases
    }

    /// The source-control capability.
    pub fn source(&self) -> &Arc<dyn RepositorySource> {
        &self.source
    }

    /// Read and parse the declaration file at `tag`, falling back to the
    /// default declaration.
    pub async fn manifest_at(&self, tag: &str) -> crate::error::Result<Manifest> {
        let bytes = self.source.read_file_at_tag(tag, MANIFEST_FILE).await?;
        Ok(Manifest::load_or_default(bytes.as_deref(), &self.info.name))
    }

    /// Build a release for `tag` and register it.
    pub async fn create_release(&self, tag: &TagInfo) -> crate::error::Result<HookReport> {
        let manifest = self.manifest_at(&tag.name).await?;
        let release = Release::new(
            self.info.clone(),
            tag.name.clone(),
            tag.created_at,
            manifest.apps,
            self.source.clone(),
            self.run_dir.clone(),
        );
        Ok(self.releases.new_release(Arc::new(release)))
    }

    /// Register a release for every configured tag not yet known.
    ///
    /// Returns the failures reported by release hooks.
    pub async fn sync_tags(&self) -> crate::error::Result<Vec<Error>> {
        let tags = self.source.list_tags().await?;
        let mut failures = Vec::new();
        for tag in tags {
            if !is_configured_tag(&tag.name) {
                info!(repo = %self.info.name, tag = %tag.name, "Ignoring unconfigured tag");
                continue;
            }
            if self.releases.get(&tag.name).is_some() {
                continue;
            }
            match self.create_release(&tag).await {
                Ok(report) => failures.extend(report.failures),
                Err(e) => {
                    warn!(repo = %self.info.name, tag = %tag.name, error = %e, "Failed to create release");
                    failures.push(e);
                }
            }
        }
        Ok(failures)
    }

    /// Remove a release, evict its snapshot and delete the tag.
    pub async fn delete_release(&self, tag: &str) -> crate::error::Result<HookReport> {
        let report = self.releases.delete_release(tag).await;
        if !report.applied {
            return Err(Error::NotFound(format!("release {} of {}", tag, self.info.name)));
        }
        self.source.delete_tag(tag).await?;
        debug!(repo = %self.info.name, tag, "Deleted tag");
        Ok(report)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("info", &self.info)
            .field("run_dir", &self.run_dir)
            .field("releases", &self.releases.tags())
            .finish()
    }
}

/// Repository source whose tags are directories: `<root>/<tag>/`.
#[derive(Debug, Clone)]
pub struct FsRepositorySource {
    root: PathBuf,
}

impl FsRepositorySource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tag_dir(&self, tag: &str) -> RepositoryResult<PathBuf> {
        if tag.is_empty() || tag.contains('/') || tag == "." || tag == ".." {
            return Err(RepositoryError::TagNotFound(tag.to_string()));
        }
        Ok(self.root.join(tag))
    }
}

#[async_trait]
impl RepositorySource for FsRepositorySource {
    async fn materialize_tag(&self, tag: &str, dest: &Path) -> RepositoryResult<()> {
        let src = self.tag_dir(tag)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(RepositoryError::TagNotFound(tag.to_string()));
        }
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .map_err(|e| RepositoryError::Other(format!("copy task failed: {}", e)))??;
        Ok(())
    }

    async fn list_tags(&self) -> RepositoryResult<Vec<TagInfo>> {
        let mut tags = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tags),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            tags.push(TagInfo { name, created_at });
        }
        tags.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(tags)
    }

    async fn delete_tag(&self, tag: &str) -> RepositoryResult<()> {
        let dir = self.tag_dir(tag)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RepositoryError::TagNotFound(tag.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file_at_tag(&self, tag: &str, path: &str) -> RepositoryResult<Option<Vec<u8>>> {
        let dir = self.tag_dir(tag)?;
        if Path::new(path)
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Ok(None);
        }
        match tokio::fs::read(dir.join(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Recursively copy `src` into a new directory `dest`.
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multi-tenant artifact index.
//!
//! Two levels:
//!
//! - `by_owner[owner][name][version]`: every artifact, keyed by the owner it
//!   is indexed under (the receiver for shared clones).
//! - `canonical[name][version]`: only artifacts held by their release's true
//!   owner. Name-uniqueness checks read this index.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::artifact::Artifact;
use crate::manifest::AppKind;
use crate::repository::{OwnerId, RepositoryId};

/// Version selector meaning "most recent release".
pub const LATEST: &str = "latest";

type Versions<T> = BTreeMap<String, Arc<T>>;
type ByName<T> = BTreeMap<String, Versions<T>>;

struct Indices<T> {
    canonical: ByName<T>,
    by_owner: BTreeMap<OwnerId, ByName<T>>,
}

fn insert<T: Artifact>(index: &mut ByName<T>, object: &Arc<T>) -> bool {
    let versions = index.entry(object.name().to_string()).or_default();
    if versions.contains_key(object.version()) {
        return false;
    }
    versions.insert(object.version().to_string(), object.clone());
    true
}

fn remove<T>(index: &mut ByName<T>, name: &str, version: &str) -> Option<Arc<T>> {
    let versions = index.get_mut(name)?;
    let removed = versions.remove(version);
    if versions.is_empty() {
        index.remove(name);
    }
    removed
}

fn latest<'a, T: Artifact>(objects: impl Iterator<Item = &'a Arc<T>>) -> Option<Arc<T>> {
    objects.max_by_key(|o| o.release().created_at()).cloned()
}

/// Index of one family of artifacts (scripts or services).
pub struct ObjCollection<T: Artifact> {
    kinds: Vec<AppKind>,
    indices: Mutex<Indices<T>>,
}

impl<T: Artifact> ObjCollection<T> {
    /// Create an empty collection holding artifacts of `kinds`.
    pub fn new(kinds: impl IntoIterator<Item = AppKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            indices: Mutex::new(Indices {
                canonical: BTreeMap::new(),
                by_owner: BTreeMap::new(),
            }),
        }
    }

    /// Kinds this collection holds.
    pub fn kinds(&self) -> &[AppKind] {
        &self.kinds
    }

    /// Whether artifacts of `kind` belong here.
    pub fn accepts(&self, kind: AppKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Register an artifact.
    ///
    /// Returns false, leaving the index untouched, when the owner already has
    /// an artifact with the same name and version.
    pub fn new_object(&self, object: Arc<T>) -> bool {
        let owner = object.release().indexed_owner();
        let mut indices = self.indices.lock();
        if !insert(indices.by_owner.entry(owner).or_default(), &object) {
            return false;
        }
        if !object.release().is_shared() {
            insert(&mut indices.canonical, &object);
        }
        true
    }

    /// Remove `owner`'s artifact `name@version`.
    pub fn delete_object(&self, owner: OwnerId, name: &str, version: &str) -> Option<Arc<T>> {
        let mut indices = self.indices.lock();
        let owned = indices.by_owner.get_mut(&owner)?;
        let removed = remove(owned, name, version)?;
        if owned.is_empty() {
            indices.by_owner.remove(&owner);
        }

        if !removed.release().is_shared() {
            let canonical_match = indices
                .canonical
                .get(name)
                .and_then(|versions| versions.get(version))
                .is_some_and(|o| Arc::ptr_eq(o, &removed));
            if canonical_match {
                remove(&mut indices.canonical, name, version);
            }
        }
        Some(removed)
    }

    /// Every canonical artifact.
    pub fn get_all(&self) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .canonical
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    /// Every canonical version of `name`.
    pub fn get_by_name(&self, name: &str) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .canonical
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `name@version` under every owner, originals and clones.
    pub fn get_objects(&self, name: &str, version: &str) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .values()
            .filter_map(|owned| owned.get(name).and_then(|versions| versions.get(version)))
            .cloned()
            .collect()
    }

    /// Every artifact, under any owner, built from release `tag` of `repository`.
    pub fn get_objects_for_release(&self, repository: RepositoryId, tag: &str) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .values()
            .flat_map(|owned| owned.values())
            .flat_map(|versions| versions.values())
            .filter(|o| o.release().repository().id == repository && o.version() == tag)
            .cloned()
            .collect()
    }

    /// Everything indexed under `owner`, including clones shared to them.
    pub fn get_all_for_user(&self, owner: OwnerId) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .get(&owner)
            .map(|owned| {
                owned
                    .values()
                    .flat_map(|versions| versions.values().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every version of `name` indexed under `owner`.
    pub fn get_by_name_for_user(&self, owner: OwnerId, name: &str) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .get(&owner)
            .and_then(|owned| owned.get(name))
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `owner`'s artifact `name@version`.
    pub fn get_object_for_user(&self, owner: OwnerId, name: &str, version: &str) -> Option<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .get(&owner)
            .and_then(|owned| owned.get(name))
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// Whether `owner` has `name@version`.
    pub fn has_object(&self, owner: OwnerId, name: &str, version: &str) -> bool {
        self.get_object_for_user(owner, name, version).is_some()
    }

    /// Most recent canonical release of `name`.
    pub fn get_latest_for_name(&self, name: &str) -> Option<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .canonical
            .get(name)
            .and_then(|versions| latest(versions.values()))
    }

    /// Most recent release of `name` indexed under `owner`.
    pub fn get_latest_for_user_named(&self, owner: OwnerId, name: &str) -> Option<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .get(&owner)
            .and_then(|owned| owned.get(name))
            .and_then(|versions| latest(versions.values()))
    }

    /// Look up `owner`'s `name` at `version`, or at the newest release when
    /// `version` is [`LATEST`].
    pub fn resolve(&self, owner: OwnerId, name: &str, version: &str) -> Option<Arc<T>> {
        if version == LATEST {
            self.get_latest_for_user_named(owner, name)
        } else {
            self.get_object_for_user(owner, name, version)
        }
    }

    /// True unless a repository other than `repository` already publishes an
    /// artifact called `name`.
    pub fn is_name_available(&self, name: &str, repository: RepositoryId) -> bool {
        let indices = self.indices.lock();
        indices.canonical.get(name).is_none_or(|versions| {
            versions
                .values()
                .all(|o| o.release().repository().id == repository)
        })
    }

    /// Every indexed artifact, originals and clones.
    pub fn all_objects(&self) -> Vec<Arc<T>> {
        let indices = self.indices.lock();
        indices
            .by_owner
            .values()
            .flat_map(|owned| owned.values())
            .flat_map(|versions| versions.values().cloned())
            .collect()
    }

    /// Number of indexed artifacts, originals and clones.
    pub fn len(&self) -> usize {
        let indices = self.indices.lock();
        indices
            .by_owner
            .values()
            .flat_map(|owned| owned.values())
            .map(|versions| versions.len())
            .sum()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.indices.lock().by_owner.is_empty()
    }
}

impl<T: Artifact> std::fmt::Debug for ObjCollection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjCollection")
            .field("kinds", &self.kinds)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Script;
    use crate::runner::MockRunner;
    use crate::testing::{at, declaration, release_at, repo_info};
    use tempfile::TempDir;

    fn script(dir: &TempDir, repo: RepositoryId, owner: OwnerId, name: &str, tag: &str, minute: i64) -> Arc<Script> {
        let release = release_at(dir.path(), repo_info(repo, "repo", owner), tag, at(minute));
        Script::new(release, name, declaration(AppKind::Python), Arc::new(MockRunner::new())).unwrap()
    }

    fn collection() -> ObjCollection<Script> {
        ObjCollection::new([AppKind::Python, AppKind::Streamlit])
    }

    #[test]
    fn test_accepts_declared_kinds() {
        let scripts = collection();
        assert!(scripts.accepts(AppKind::Python));
        assert!(!scripts.accepts(AppKind::Service));
    }

    #[tokio::test]
    async fn test_new_object_is_unique_per_owner() {
        let dir = TempDir::new().unwrap();
        let scripts = collection();
        assert!(scripts.new_object(script(&dir, 1, 1, "app", "v1", 0)));
        assert!(!scripts.new_object(script(&dir, 1, 1, "app", "v1", 0)));
        assert_eq!(scripts.len(), 1);
        assert!(scripts.has_object(1, "app", "v1"));
        assert!(!scripts.has_object(2, "app", "v1"));
    }

    #[tokio::test]
    async fn test_shared_clone_stays_out_of_canonical_index() {
        let dir = TempDir::new().unwrap();
        let scripts = collection();
        let original = script(&dir, 1, 1, "app", "v1", 0);
        let shared = original.clone_to_shared(2).unwrap();
        scripts.new_object(original.clone());
        scripts.new_object(shared.clone());

        assert_eq!(scripts.get_all().len(), 1);
        assert_eq!(scripts.get_objects("app", "v1").len(), 2);
        assert_eq!(scripts.get_all_for_user(2).len(), 1);

        let removed = scripts.delete_object(2, "app", "v1").unwrap();
        assert!(Arc::ptr_eq(&removed, &shared));
        assert_eq!(scripts.get_all().len(), 1);

        scripts.delete_object(1, "app", "v1").unwrap();
        assert!(scripts.get_all().is_empty());
        assert!(scripts.is_empty());
    }

    #[tokio::test]
    async fn test_latest_uses_release_time() {
        let dir = TempDir::new().unwrap();
        let scripts = collection();
        scripts.new_object(script(&dir, 1, 1, "app", "b-old", 0));
        scripts.new_object(script(&dir, 1, 1, "app", "a-new", 10));
        scripts.new_object(script(&dir, 1, 1, "other", "v9", 20));

        assert_eq!(scripts.get_latest_for_user_named(1, "app").unwrap().version(), "a-new");
        assert_eq!(scripts.get_latest_for_name("app").unwrap().version(), "a-new");
        assert_eq!(scripts.resolve(1, "app", LATEST).unwrap().version(), "a-new");
        assert_eq!(scripts.resolve(1, "app", "b-old").unwrap().version(), "b-old");
        assert!(scripts.resolve(1, "app", "v9").is_none());
        assert!(scripts.get_latest_for_user_named(2, "app").is_none());
        assert_eq!(scripts.get_by_name_for_user(1, "app").len(), 2);
        assert_eq!(scripts.get_by_name("app").len(), 2);
    }

    #[tokio::test]
    async fn test_name_availability_tracks_other_repositories() {
        let dir = TempDir::new().unwrap();
        let scripts = collection();
        assert!(scripts.is_name_available("myapp", 5));

        scripts.new_object(script(&dir, 4, 1, "myapp", "v1", 0));
        assert!(!scripts.is_name_available("myapp", 5));
        assert!(scripts.is_name_available("myapp", 4));

        scripts.delete_object(1, "myapp", "v1");
        assert!(scripts.is_name_available("myapp", 5));
    }

    #[tokio::test]
    async fn test_objects_for_release() {
        let dir = TempDir::new().unwrap();
        let scripts = collection();
        let a = script(&dir, 1, 1, "a", "v1", 0);
        scripts.new_object(a.clone());
        scripts.new_object(a.clone_to_shared(3).unwrap());
        scripts.new_object(script(&dir, 1, 1, "b", "v1", 0));
        scripts.new_object(script(&dir, 1, 1, "a", "v2", 1));
        scripts.new_object(script(&dir, 2, 7, "c", "v1", 0));

        assert_eq!(scripts.get_objects_for_release(1, "v1").len(), 3);
        assert_eq!(scripts.get_objects_for_release(2, "v1").len(), 1);
        assert_eq!(scripts.all_objects().len(), 5);
    }
}

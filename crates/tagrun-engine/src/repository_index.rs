// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of repositories.
//!
//! Registering a repository hooks its release set into the object indices:
//! every created release projects its declared apps into scripts or services,
//! every deleted release purges them.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, Script, Service, ServiceSettings};
use crate::collection::ObjCollection;
use crate::error::{Error, Result};
use crate::release::{HookReport, Release};
use crate::repository::{
    FsRepositorySource, OwnerId, Repository, RepositoryId, RepositoryInfo, RepositorySource, TagInfo,
    is_configured_tag,
};
use crate::runner::RunnerFactory;

struct Fanout {
    scripts: Arc<ObjCollection<Script>>,
    services: Arc<ObjCollection<Service>>,
    factory: Arc<dyn RunnerFactory>,
    service_settings: ServiceSettings,
}

impl Fanout {
    fn release_created(&self, release: &Arc<Release>) -> Result<()> {
        let mut failures = Vec::new();

        for (name, declaration) in release.apps() {
            let kind = declaration.kind;
            let runner = match self
                .factory
                .for_app(kind, release.disk_path().to_path_buf())
            {
                Some(runner) => runner,
                None => {
                    warn!(name = %name, kind = %kind, tag = %release.tag(), "Skipping app of unknown type");
                    continue;
                }
            };

            let registered = if self.scripts.accepts(kind) {
                Script::new(release.clone(), name.clone(), declaration.clone(), runner)
                    .map(|script| self.scripts.new_object(script))
            } else if self.services.accepts(kind) {
                Service::new(
                    release.clone(),
                    name.clone(),
                    declaration.clone(),
                    runner,
                    self.service_settings,
                )
                .map(|service| self.services.new_object(service))
            } else {
                continue;
            };

            match registered {
                Ok(true) => debug!(name = %name, kind = %kind, tag = %release.tag(), "Registered artifact"),
                Ok(false) => debug!(name = %name, tag = %release.tag(), "Artifact already registered"),
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Hook(failures.join("; ")))
        }
    }

    fn release_deleted(&self, repo: &RepositoryInfo, release: &Arc<Release>) {
        let scripts = purge(&self.scripts, repo.id, release.tag());
        let services = purge(&self.services, repo.id, release.tag());
        if scripts.is_empty() && services.is_empty() {
            return;
        }

        let grace = self.service_settings.terminate_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    retire_all(&scripts, grace).await;
                    retire_all(&services, grace).await;
                });
            }
            Err(_) => warn!(repo = %repo.name, tag = %release.tag(), "No runtime to stop purged artifacts"),
        }
    }
}

fn purge<T: Artifact>(collection: &ObjCollection<T>, repo: RepositoryId, tag: &str) -> Vec<Arc<T>> {
    let objects = collection.get_objects_for_release(repo, tag);
    for object in &objects {
        collection.delete_object(object.release().indexed_owner(), object.name(), object.version());
    }
    objects
}

async fn retire_all<T: Artifact>(objects: &[Arc<T>], grace: Duration) -> Vec<Error> {
    let mut failures = Vec::new();
    for object in objects {
        if let Err(e) = object.retire(grace).await {
            warn!(name = %object.name(), version = %object.version(), error = %e, "Failed to stop artifact");
            failures.push(e);
        }
    }
    failures
}

/// Registry of repositories feeding the script and service indices.
pub struct RepositoryIndex {
    fanout: Arc<Fanout>,
    run_dir: PathBuf,
    repositories: Mutex<BTreeMap<RepositoryId, Arc<Repository>>>,
    /// Held across the name check and the release insert of a publish.
    publishing: tokio::sync::Mutex<()>,
}

impl RepositoryIndex {
    /// Create an empty registry.
    pub fn new(
        scripts: Arc<ObjCollection<Script>>,
        services: Arc<ObjCollection<Service>>,
        factory: Arc<dyn RunnerFactory>,
        service_settings: ServiceSettings,
        run_dir: PathBuf,
    ) -> Self {
        Self {
            fanout: Arc::new(Fanout {
                scripts,
                services,
                factory,
                service_settings,
            }),
            run_dir,
            repositories: Mutex::new(BTreeMap::new()),
            publishing: tokio::sync::Mutex::new(()),
        }
    }

    /// Script index.
    pub fn scripts(&self) -> &Arc<ObjCollection<Script>> {
        &self.fanout.scripts
    }

    /// Service index.
    pub fn services(&self) -> &Arc<ObjCollection<Service>> {
        &self.fanout.services
    }

    /// Root under which releases are materialized.
    pub fn run_dir(&self) -> &PathBuf {
        &self.run_dir
    }

    /// Create a repository over `source`, register it and sync its tags.
    ///
    /// Returns the repository and the non-fatal failures of the sync.
    pub async fn open_repository(
        &self,
        info: RepositoryInfo,
        source: Arc<dyn RepositorySource>,
    ) -> Result<(Arc<Repository>, Vec<Error>)> {
        let repository = Arc::new(Repository::new(info, source, self.run_dir.clone()));
        self.add_repository(repository.clone())?;
        let failures = repository.sync_tags().await?;
        Ok((repository, failures))
    }

    /// Open every repository under `root`, laid out as
    /// `<owner_id>/<repo_name>/<tag>/`, assigning ids in discovery order.
    ///
    /// Directories whose owner part is not a number are skipped.
    pub async fn open_directory_tree(&self, root: &Path) -> Result<Vec<Error>> {
        let mut failures = Vec::new();
        let mut next_id = self
            .repositories
            .lock()
            .keys()
            .next_back()
            .map_or(1, |id| id + 1);

        for (owner, owner_dir) in sorted_dirs(root).await? {
            let Ok(owner_id) = owner.parse::<OwnerId>() else {
                warn!(path = %owner_dir.display(), "Skipping non-numeric owner directory");
                continue;
            };
            for (name, repo_dir) in sorted_dirs(&owner_dir).await? {
                let info = RepositoryInfo {
                    id: next_id,
                    name,
                    owner_id,
                    owner_name: owner.clone(),
                };
                next_id += 1;
                match self
                    .open_repository(info, Arc::new(FsRepositorySource::new(repo_dir)))
                    .await
                {
                    Ok((_, sync_failures)) => failures.extend(sync_failures),
                    Err(e) => failures.push(e),
                }
            }
        }
        Ok(failures)
    }

    /// Register a repository and project its existing releases.
    pub fn add_repository(&self, repository: Arc<Repository>) -> Result<Vec<Error>> {
        {
            let mut repositories = self.repositories.lock();
            if repositories.contains_key(&repository.id()) {
                return Err(Error::InvalidRequest(format!(
                    "repository {} is already registered",
                    repository.id()
                )));
            }
            repositories.insert(repository.id(), repository.clone());
        }

        let fanout = self.fanout.clone();
        repository
            .releases()
            .add_created_hook(Arc::new(move |_: &RepositoryInfo, release: &Arc<Release>| {
                fanout.release_created(release)
            }));
        let fanout = self.fanout.clone();
        repository.releases().add_deleted_hook(Arc::new(move |repo: &RepositoryInfo, release: &Arc<Release>| {
            fanout.release_deleted(repo, release);
            Ok(())
        }));

        let failures: Vec<Error> = repository
            .releases()
            .list()
            .iter()
            .filter_map(|release| self.fanout.release_created(release).err())
            .collect();
        info!(
            repo = %repository.name(),
            repo_id = repository.id(),
            owner_id = repository.owner_id(),
            releases = repository.releases().len(),
            "Registered repository"
        );
        Ok(failures)
    }

    /// Repository with `id`.
    pub fn get_by_id(&self, id: RepositoryId) -> Option<Arc<Repository>> {
        self.repositories.lock().get(&id).cloned()
    }

    /// Repositories called `name`, across owners.
    pub fn get_by_name(&self, name: &str) -> Vec<Arc<Repository>> {
        self.repositories
            .lock()
            .values()
            .filter(|r| r.name() == name)
            .cloned()
            .collect()
    }

    /// Repositories owned by `owner`.
    pub fn get_by_owner(&self, owner: OwnerId) -> Vec<Arc<Repository>> {
        self.repositories
            .lock()
            .values()
            .filter(|r| r.owner_id() == owner)
            .cloned()
            .collect()
    }

    /// `owner`'s repository called `name`.
    pub fn get_for_owner(&self, owner: OwnerId, name: &str) -> Option<Arc<Repository>> {
        self.repositories
            .lock()
            .values()
            .find(|r| r.owner_id() == owner && r.name() == name)
            .cloned()
    }

    /// Every registered repository.
    pub fn repositories(&self) -> Vec<Arc<Repository>> {
        self.repositories.lock().values().cloned().collect()
    }

    async fn retire_release_artifacts(&self, repo: RepositoryId, tag: &str) -> Vec<Error> {
        let grace = self.fanout.service_settings.terminate_grace;
        let mut failures = retire_all(&self.fanout.scripts.get_objects_for_release(repo, tag), grace).await;
        failures.extend(retire_all(&self.fanout.services.get_objects_for_release(repo, tag), grace).await);
        failures
    }

    /// Publish `tag` of repository `id` as a release.
    ///
    /// Fails with [`Error::NameUnavailable`] when another repository already
    /// publishes one of the tag's app names; the tag is left as it is.
    /// Publishes are serialized, so concurrent publishes of the same name
    /// from different repositories admit at most one.
    pub async fn publish_release(&self, id: RepositoryId, tag: &TagInfo) -> Result<HookReport> {
        let repository = self
            .get_by_id(id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))?;
        if !is_configured_tag(&tag.name) {
            return Err(Error::InvalidRequest(format!(
                "tag {} is marked unconfigured",
                tag.name
            )));
        }

        let _publishing = self.publishing.lock().await;
        let manifest = repository.manifest_at(&tag.name).await?;
        for (name, declaration) in &manifest.apps {
            let available = if self.fanout.services.accepts(declaration.kind) {
                self.fanout.services.is_name_available(name, id)
            } else {
                self.fanout.scripts.is_name_available(name, id)
            };
            if !available {
                warn!(repo = %repository.name(), tag = %tag.name, name = %name, "App name already published");
                return Err(Error::NameUnavailable(name.clone()));
            }
        }

        repository.create_release(tag).await
    }

    /// Stop the artifacts of a release, then delete it and its tag.
    pub async fn delete_release(&self, id: RepositoryId, tag: &str) -> Result<HookReport> {
        let repository = self
            .get_by_id(id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))?;
        let stop_failures = self.retire_release_artifacts(id, tag).await;
        let mut report = repository.delete_release(tag).await?;
        report.failures.extend(stop_failures);
        Ok(report)
    }

    /// Unregister a repository, stopping and purging every artifact derived
    /// from it and evicting its snapshots.
    ///
    /// Tags in source control are left untouched.
    pub async fn delete_repository(&self, id: RepositoryId) -> Result<Vec<Error>> {
        let repository = self
            .repositories
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))?;

        let mut failures = Vec::new();
        for tag in repository.releases().tags() {
            failures.extend(self.retire_release_artifacts(id, &tag).await);
            failures.extend(repository.releases().delete_release(&tag).await.failures);
        }
        info!(repo = %repository.name(), repo_id = id, failures = failures.len(), "Deleted repository");
        Ok(failures)
    }

    /// Snapshot directories of every registered release and shared clone.
    pub fn claimed_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths: BTreeSet<PathBuf> = self
            .repositories()
            .iter()
            .flat_map(|r| r.releases().list())
            .map(|release| release.disk_path().to_path_buf())
            .collect();
        paths.extend(
            self.fanout
                .scripts
                .all_objects()
                .iter()
                .map(|o| o.release().disk_path().to_path_buf()),
        );
        paths.extend(
            self.fanout
                .services
                .all_objects()
                .iter()
                .map(|o| o.release().disk_path().to_path_buf()),
        );
        paths
    }
}

impl std::fmt::Debug for RepositoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryIndex")
            .field("run_dir", &self.run_dir)
            .field("repositories", &self.repositories.lock().len())
            .finish()
    }
}

async fn sorted_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() && !name.starts_with('.') {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AppKind;
    use crate::runner::{MockRunner, MockRunnerFactory};
    use chrono::Utc;
    use tempfile::TempDir;

    const MANIFEST: &str = "apps:
  dash:
    type: streamlit
    config: {entry_file: app.py}
  worker:
    type: service
    config: {entry_file: worker.py}
  odd:
    type: lambda
    config: {entry_file: x.py}
";

    struct Fixture {
        _dir: TempDir,
        repos: PathBuf,
        run_dir: PathBuf,
        index: RepositoryIndex,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let repos = dir.path().join("repos");
        let run_dir = dir.path().join("run");
        let index = RepositoryIndex::new(
            Arc::new(ObjCollection::new([AppKind::Python, AppKind::Streamlit])),
            Arc::new(ObjCollection::new([AppKind::Service])),
            Arc::new(MockRunnerFactory::new(MockRunner::never_completing())),
            ServiceSettings {
                startup_tries: 2,
                terminate_grace: Duration::from_millis(50),
            },
            run_dir.clone(),
        );
        Fixture {
            _dir: dir,
            repos,
            run_dir,
            index,
        }
    }

    fn write_tag(root: &Path, tag: &str, manifest: &str) {
        std::fs::create_dir_all(root.join(tag)).unwrap();
        std::fs::write(root.join(tag).join("appconfig.yml"), manifest).unwrap();
    }

    fn info(id: RepositoryId, name: &str, owner: OwnerId) -> RepositoryInfo {
        RepositoryInfo {
            id,
            name: name.to_string(),
            owner_id: owner,
            owner_name: format!("user{}", owner),
        }
    }

    #[tokio::test]
    async fn test_open_repository_projects_apps() {
        let f = fixture();
        let root = f.repos.join("demo");
        write_tag(&root, "v1", MANIFEST);
        write_tag(&root, "v2uc", MANIFEST);

        let (repo, failures) = f
            .index
            .open_repository(info(1, "demo", 1), Arc::new(FsRepositorySource::new(&root)))
            .await
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(repo.releases().tags(), vec!["v1"]);
        assert!(f.index.scripts().has_object(1, "dash", "v1"));
        assert!(f.index.services().has_object(1, "worker", "v1"));
        assert_eq!(f.index.scripts().len() + f.index.services().len(), 2);

        assert_eq!(f.index.get_by_name("demo").len(), 1);
        assert_eq!(f.index.get_by_owner(1).len(), 1);
        assert!(f.index.get_for_owner(1, "demo").is_some());
        assert!(f.index.get_by_id(2).is_none());
        assert!(f.index.add_repository(repo).is_err());
    }

    #[tokio::test]
    async fn test_missing_manifest_falls_back_to_default_app() {
        let f = fixture();
        let root = f.repos.join("plain");
        std::fs::create_dir_all(root.join("v1")).unwrap();

        f.index
            .open_repository(info(1, "plain", 1), Arc::new(FsRepositorySource::new(&root)))
            .await
            .unwrap();
        let script = f.index.scripts().get_object_for_user(1, "plain", "v1").unwrap();
        assert_eq!(script.config().kind, AppKind::Streamlit);
        assert_eq!(script.config().config.entry_file, "main.py");
    }

    #[tokio::test]
    async fn test_publish_rejects_taken_name() {
        let f = fixture();
        let first = f.repos.join("first");
        let second = f.repos.join("second");
        write_tag(&first, "v1", MANIFEST);
        f.index
            .open_repository(info(1, "first", 1), Arc::new(FsRepositorySource::new(&first)))
            .await
            .unwrap();
        f.index
            .open_repository(info(2, "second", 2), Arc::new(FsRepositorySource::new(&second)))
            .await
            .unwrap();

        write_tag(&second, "v1", MANIFEST);
        let tag = TagInfo {
            name: "v1".to_string(),
            created_at: Utc::now(),
        };
        let err = f.index.publish_release(2, &tag).await.unwrap_err();
        assert!(matches!(err, Error::NameUnavailable(ref name) if name == "dash" || name == "worker"));
        assert!(f.index.get_by_id(2).unwrap().releases().is_empty());
        assert!(second.join("v1").exists());

        // Same repository may publish again under a new tag.
        write_tag(&first, "v2", MANIFEST);
        let tag = TagInfo {
            name: "v2".to_string(),
            created_at: Utc::now(),
        };
        let report = f.index.publish_release(1, &tag).await.unwrap();
        assert!(report.applied);
        assert!(f.index.scripts().has_object(1, "dash", "v2"));

        let uc = TagInfo {
            name: "v3uc".to_string(),
            created_at: Utc::now(),
        };
        assert!(matches!(f.index.publish_release(1, &uc).await, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_admit_one_owner_per_name() {
        for round in 0..20 {
            let f = fixture();
            let first = f.repos.join("first");
            let second = f.repos.join("second");
            std::fs::create_dir_all(&first).unwrap();
            std::fs::create_dir_all(&second).unwrap();
            f.index
                .open_repository(info(1, "first", 1), Arc::new(FsRepositorySource::new(&first)))
                .await
                .unwrap();
            f.index
                .open_repository(info(2, "second", 2), Arc::new(FsRepositorySource::new(&second)))
                .await
                .unwrap();
            write_tag(&first, "v1", MANIFEST);
            write_tag(&second, "v1", MANIFEST);

            let tag = TagInfo {
                name: "v1".to_string(),
                created_at: Utc::now(),
            };
            let (a, b) = tokio::join!(f.index.publish_release(1, &tag), f.index.publish_release(2, &tag));
            let published = [&a, &b].iter().filter(|r| r.is_ok()).count();
            assert_eq!(published, 1, "round {}: {:?} / {:?}", round, a.is_ok(), b.is_ok());
            assert!(
                matches!(a, Err(Error::NameUnavailable(_))) || matches!(b, Err(Error::NameUnavailable(_)))
            );

            let owners: BTreeSet<RepositoryId> = f
                .index
                .scripts()
                .all_objects()
                .iter()
                .filter(|s| s.name() == "dash")
                .map(|s| s.release().repository().id)
                .collect();
            assert_eq!(owners.len(), 1);
            assert_eq!(f.index.services().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_delete_release_stops_and_purges() {
        let f = fixture();
        let root = f.repos.join("demo");
        write_tag(&root, "v1", MANIFEST);
        f.index
            .open_repository(info(1, "demo", 1), Arc::new(FsRepositorySource::new(&root)))
            .await
            .unwrap();

        let dash = f.index.scripts().get_object_for_user(1, "dash", "v1").unwrap();
        dash.run(None).await.unwrap();
        let shared = dash.clone_to_shared(5).unwrap();
        f.index.scripts().new_object(shared.clone());
        shared.run(None).await.unwrap();
        assert!(f.run_dir.join("1/demo/v1").exists());

        let report = f.index.delete_release(1, "v1").await.unwrap();
        assert!(report.applied);
        assert!(report.failures.is_empty());
        assert!(!dash.is_running());
        assert!(!shared.is_running());
        assert!(f.index.scripts().is_empty());
        assert!(f.index.services().is_empty());
        assert!(!f.run_dir.join("1/demo/v1").exists());
        assert!(!root.join("v1").exists());

        assert!(matches!(f.index.delete_release(1, "v1").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_repository_purges_everything() {
        let f = fixture();
        let root = f.repos.join("demo");
        write_tag(&root, "v1", MANIFEST);
        write_tag(&root, "v2", MANIFEST);
        f.index
            .open_repository(info(1, "demo", 1), Arc::new(FsRepositorySource::new(&root)))
            .await
            .unwrap();
        assert_eq!(f.index.claimed_paths().len(), 2);

        let failures = f.index.delete_repository(1).await.unwrap();
        assert!(failures.is_empty());
        assert!(f.index.get_by_id(1).is_none());
        assert!(f.index.scripts().is_empty());
        assert!(f.index.services().is_empty());
        assert!(f.index.claimed_paths().is_empty());
        assert!(root.join("v1").exists());
    }

    #[tokio::test]
    async fn test_open_directory_tree() {
        let f = fixture();
        write_tag(&f.repos.join("1/alpha"), "v1", MANIFEST);
        write_tag(&f.repos.join("2/beta"), "v1", "apps:\n  tool:\n    type: python\n    config: {entry_file: tool.py}\n");
        std::fs::create_dir_all(f.repos.join("nobody/gamma/v1")).unwrap();

        let failures = f.index.open_directory_tree(&f.repos).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(f.index.repositories().len(), 2);
        let alpha = f.index.get_for_owner(1, "alpha").unwrap();
        let beta = f.index.get_for_owner(2, "beta").unwrap();
        assert_ne!(alpha.id(), beta.id());
        assert!(f.index.scripts().has_object(2, "tool", "v1"));
        assert!(f.index.services().has_object(1, "worker", "v1"));
    }
}

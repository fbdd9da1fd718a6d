// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-tenant sharing overlay.
//!
//! A user's grants are re-applied to their index before each request:
//! clones whose grant is gone are retired and removed, then missing clones
//! are created from the canonical index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::collection::{LATEST, ObjCollection};
use crate::error::{Error, Result};
use crate::manifest::AppKind;
use crate::repository::OwnerId;

/// Version part of a release grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantVersion {
    /// A fixed release tag.
    Exact(String),
    /// Whatever release of the app is newest.
    Latest,
}

/// A `type;name;version` grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseGrant {
    /// Kind of the shared app.
    pub kind: AppKind,
    /// App name.
    pub name: String,
    /// Version selector.
    pub version: GrantVersion,
}

impl FromStr for ReleaseGrant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(';').map(str::trim);
        let (Some(kind), Some(name), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::InvalidRequest(format!("malformed grant: {}", s)));
        };
        if name.is_empty() || version.is_empty() {
            return Err(Error::InvalidRequest(format!("malformed grant: {}", s)));
        }
        let version = if version.eq_ignore_ascii_case(LATEST) {
            GrantVersion::Latest
        } else {
            GrantVersion::Exact(version.to_string())
        };
        Ok(Self {
            kind: kind.parse().unwrap_or(AppKind::Unknown),
            name: name.to_string(),
            version,
        })
    }
}

/// Grants held by one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGrants {
    /// `type;name;version|latest` entries.
    #[serde(default)]
    pub allowed_releases: Vec<String>,
    /// Users whose every artifact is visible.
    #[serde(default)]
    pub allowed_from_users: BTreeSet<OwnerId>,
}

impl UserGrants {
    /// Parsed release grants. Malformed entries are skipped with a warning.
    pub fn release_grants(&self) -> Vec<ReleaseGrant> {
        self.allowed_releases
            .iter()
            .filter_map(|raw| match raw.parse() {
                Ok(grant) => Some(grant),
                Err(e) => {
                    warn!(grant = %raw, error = %e, "Skipping grant");
                    None
                }
            })
            .collect()
    }
}

/// What one overlay pass changed.
#[derive(Debug, Default)]
pub struct SharingReport {
    /// Clones added to the user's index.
    pub added: usize,
    /// Clones removed from the user's index.
    pub removed: usize,
    /// Non-fatal errors from retiring or cloning.
    pub failures: Vec<Error>,
}

fn same_origin<T: Artifact>(a: &T, b: &T) -> bool {
    let (ra, rb) = (a.release(), b.release());
    ra.repository().id == rb.repository().id && ra.tag() == rb.tag() && a.name() == b.name()
}

fn granted_targets<T: Artifact>(
    collection: &ObjCollection<T>,
    user: OwnerId,
    grants: &UserGrants,
) -> BTreeMap<(String, String), Arc<T>> {
    let mut targets = BTreeMap::new();

    for grant in grants.release_grants() {
        if !collection.accepts(grant.kind) {
            continue;
        }
        let target = match &grant.version {
            GrantVersion::Latest => collection.get_latest_for_name(&grant.name),
            GrantVersion::Exact(version) => collection
                .get_by_name(&grant.name)
                .into_iter()
                .find(|o| o.version() == version),
        };
        if let Some(target) = target
            && target.kind() == grant.kind
            && target.release().owner_id() != user
        {
            targets.insert((target.name().to_string(), target.version().to_string()), target);
        }
    }

    if !grants.allowed_from_users.is_empty() {
        for target in collection.get_all() {
            let owner = target.release().owner_id();
            if owner != user && grants.allowed_from_users.contains(&owner) {
                targets
                    .entry((target.name().to_string(), target.version().to_string()))
                    .or_insert(target);
            }
        }
    }

    targets
}

/// Bring `user`'s view of `collection` in line with `grants`.
///
/// Stale clones are stopped (terminate, kill after `grace`) before removal.
pub async fn apply_grants<T: Artifact>(
    collection: &ObjCollection<T>,
    user: OwnerId,
    grants: &UserGrants,
    grace: Duration,
) -> SharingReport {
    let targets = granted_targets(collection, user, grants);
    let mut report = SharingReport::default();

    for object in collection.get_all_for_user(user) {
        if !object.release().is_shared() {
            continue;
        }
        let key = (object.name().to_string(), object.version().to_string());
        let still_granted = targets
            .get(&key)
            .is_some_and(|target| same_origin(target.as_ref(), object.as_ref()));
        if still_granted {
            continue;
        }

        collection.delete_object(user, object.name(), object.version());
        report.removed += 1;
        info!(
            user,
            name = %object.name(),
            version = %object.version(),
            owner_id = object.release().owner_id(),
            "Removing shared artifact without grant"
        );
        if let Err(e) = object.retire(grace).await {
            warn!(user, name = %object.name(), error = %e, "Failed to stop shared artifact");
            report.failures.push(e);
        }
    }

    for ((name, version), target) in targets {
        if collection.has_object(user, &name, &version) {
            continue;
        }
        match target.clone_to_shared(user) {
            Ok(clone) => {
                if collection.new_object(clone) {
                    report.added += 1;
                    debug!(user, name = %name, version = %version, "Projected shared artifact");
                }
            }
            Err(e) => {
                warn!(user, name = %name, version = %version, error = %e, "Failed to share artifact");
                report.failures.push(e);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Script;
    use crate::runner::MockRunner;
    use crate::testing::{at, declaration, release_at, repo_info};
    use tempfile::TempDir;

    fn script(dir: &TempDir, owner: OwnerId, name: &str, tag: &str, minute: i64) -> Arc<Script> {
        let release = release_at(dir.path(), repo_info(owner * 10, "repo", owner), tag, at(minute));
        Script::new(
            release,
            name,
            declaration(AppKind::Python),
            Arc::new(MockRunner::never_completing()),
        )
        .unwrap()
    }

    fn grants(releases: &[&str]) -> UserGrants {
        UserGrants {
            allowed_releases: releases.iter().map(|s| s.to_string()).collect(),
            allowed_from_users: BTreeSet::new(),
        }
    }

    #[test]
    fn test_parse_grants() {
        let grant: ReleaseGrant = "python;myapp;v1".parse().unwrap();
        assert_eq!(grant.kind, AppKind::Python);
        assert_eq!(grant.name, "myapp");
        assert_eq!(grant.version, GrantVersion::Exact("v1".to_string()));

        let grant: ReleaseGrant = "service;worker;latest".parse().unwrap();
        assert_eq!(grant.version, GrantVersion::Latest);

        assert!("python;myapp".parse::<ReleaseGrant>().is_err());
        assert!("python;;v1".parse::<ReleaseGrant>().is_err());
        assert_eq!(grants(&["bad", "python;a;v1"]).release_grants().len(), 1);
    }

    #[tokio::test]
    async fn test_release_grant_projects_independent_clone() {
        let dir = TempDir::new().unwrap();
        let scripts = ObjCollection::new([AppKind::Python, AppKind::Streamlit]);
        let original = script(&dir, 1, "myapp", "v1", 0);
        scripts.new_object(original.clone());

        let report = apply_grants(&scripts, 2, &grants(&["python;myapp;v1"]), Duration::from_millis(20)).await;
        assert_eq!(report.added, 1);
        let shared = scripts.get_object_for_user(2, "myapp", "v1").unwrap();
        assert!(shared.release().is_shared());

        original.run(None).await.unwrap();
        shared.run(None).await.unwrap();
        shared.kill(None).await.unwrap();
        assert!(original.is_running());
        assert!(!shared.is_running());
        original.kill(None).await.unwrap();

        // Re-applying the same grants is a no-op.
        let report = apply_grants(&scripts, 2, &grants(&["python;myapp;v1"]), Duration::from_millis(20)).await;
        assert_eq!((report.added, report.removed), (0, 0));
    }

    #[tokio::test]
    async fn test_dropped_grant_stops_and_removes_clone() {
        let dir = TempDir::new().unwrap();
        let scripts = ObjCollection::new([AppKind::Python]);
        scripts.new_object(script(&dir, 1, "myapp", "v1", 0));
        apply_grants(&scripts, 2, &grants(&["python;myapp;v1"]), Duration::from_millis(20)).await;
        let shared = scripts.get_object_for_user(2, "myapp", "v1").unwrap();
        shared.run(None).await.unwrap();

        let report = apply_grants(&scripts, 2, &UserGrants::default(), Duration::from_millis(20)).await;
        assert_eq!(report.removed, 1);
        assert!(report.failures.is_empty());
        assert!(!shared.is_running());
        assert!(!scripts.has_object(2, "myapp", "v1"));
        assert!(scripts.has_object(1, "myapp", "v1"));
    }

    #[tokio::test]
    async fn test_latest_grant_follows_new_releases() {
        let dir = TempDir::new().unwrap();
        let scripts = ObjCollection::new([AppKind::Python]);
        scripts.new_object(script(&dir, 1, "myapp", "v1", 0));
        let latest = grants(&["python;myapp;latest"]);

        apply_grants(&scripts, 2, &latest, Duration::from_millis(20)).await;
        assert!(scripts.has_object(2, "myapp", "v1"));

        scripts.new_object(script(&dir, 1, "myapp", "v2", 5));
        let report = apply_grants(&scripts, 2, &latest, Duration::from_millis(20)).await;
        assert_eq!((report.added, report.removed), (1, 1));
        assert!(scripts.has_object(2, "myapp", "v2"));
        assert!(!scripts.has_object(2, "myapp", "v1"));
    }

    #[tokio::test]
    async fn test_trusted_user_shares_everything() {
        let dir = TempDir::new().unwrap();
        let scripts = ObjCollection::new([AppKind::Python]);
        scripts.new_object(script(&dir, 1, "a", "v1", 0));
        scripts.new_object(script(&dir, 1, "b", "v1", 0));
        scripts.new_object(script(&dir, 3, "c", "v1", 0));

        let trust = UserGrants {
            allowed_releases: Vec::new(),
            allowed_from_users: BTreeSet::from([1]),
        };
        let report = apply_grants(&scripts, 2, &trust, Duration::from_millis(20)).await;
        assert_eq!(report.added, 2);
        assert_eq!(scripts.get_all_for_user(2).len(), 2);
        assert!(!scripts.has_object(2, "c", "v1"));
    }

    #[tokio::test]
    async fn test_grants_for_other_kinds_or_own_apps_are_ignored() {
        let dir = TempDir::new().unwrap();
        let scripts = ObjCollection::new([AppKind::Python]);
        scripts.new_object(script(&dir, 1, "myapp", "v1", 0));

        let report = apply_grants(
            &scripts,
            1,
            &grants(&["python;myapp;v1", "service;myapp;v1", "streamlit;myapp;v1"]),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(report.added, 0);
        assert_eq!(scripts.len(), 1);
    }
}

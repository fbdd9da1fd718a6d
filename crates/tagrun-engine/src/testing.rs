// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::manifest::{AppDeclaration, AppKind, RuntimeConfig};
use crate::release::Release;
use crate::repository::{OwnerId, RepositoryId, RepositoryInfo, RepositoryResult, RepositorySource, TagInfo};

/// Source whose checkouts are empty directories.
pub struct EmptySource;

#[async_trait]
impl RepositorySource for EmptySource {
    async fn materialize_tag(&self, _tag: &str, dest: &Path) -> RepositoryResult<()> {
        tokio::fs::create_dir_all(dest).await?;
        Ok(())
    }

    async fn list_tags(&self) -> RepositoryResult<Vec<TagInfo>> {
        Ok(Vec::new())
    }

    async fn delete_tag(&self, _tag: &str) -> RepositoryResult<()> {
        Ok(())
    }

    async fn read_file_at_tag(&self, _tag: &str, _path: &str) -> RepositoryResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

pub fn declaration(kind: AppKind) -> AppDeclaration {
    AppDeclaration {
        app_icon: None,
        kind,
        config: RuntimeConfig {
            entry_file: "main.py".to_string(),
            env: BTreeMap::new(),
            cli_args: Vec::new(),
        },
    }
}

pub fn repo_info(id: RepositoryId, name: &str, owner_id: OwnerId) -> RepositoryInfo {
    RepositoryInfo {
        id,
        name: name.to_string(),
        owner_id,
        owner_name: format!("user{}", owner_id),
    }
}

/// `minutes` after a fixed epoch, for ordering releases.
pub fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()
        + chrono::Duration::minutes(minutes)
}

pub fn release_at(run_dir: &Path, repo: RepositoryInfo, tag: &str, created_at: DateTime<Utc>) -> Arc<Release> {
    Arc::new(Release::new(
        repo,
        tag.to_string(),
        created_at,
        BTreeMap::new(),
        Arc::new(EmptySource),
        run_dir.to_path_buf(),
    ))
}

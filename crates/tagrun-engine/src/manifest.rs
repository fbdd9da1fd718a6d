// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application declarations (`appconfig.yml`).
//!
//! A repository declares its runnable applications in a YAML file at the root
//! of every tagged snapshot:
//!
//! ```yaml
//! apps:
//!   report:
//!     app_icon: chart
//!     type: streamlit
//!     config:
//!       entry_file: main.py
//!       env: { MODE: full }
//!       cli_args: [--verbose]
//! metadata:
//!   imported_from: https://example.com/report.git
//! ```
//!
//! A missing or malformed file falls back to [`Manifest::default_for`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// File name of the declaration file inside a snapshot.
pub const MANIFEST_FILE: &str = "appconfig.yml";

/// Declaration file errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The document is not valid YAML or does not match the schema.
    #[error("Invalid app declaration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The document declares no applications.
    #[error("App declaration is empty")]
    Empty,
}

/// Kind of a declared application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// On-demand interpreter script.
    Python,
    /// On-demand web app bound to a port.
    Streamlit,
    /// Supervised long-running process.
    Service,
    /// Any unrecognised `type` value.
    #[serde(other)]
    Unknown,
}

impl AppKind {
    /// Lowercase name as used in declarations and sharing grants.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Python => "python",
            AppKind::Streamlit => "streamlit",
            AppKind::Service => "service",
            AppKind::Unknown => "unknown",
        }
    }

    /// Whether artifacts of this kind bind a port.
    pub fn needs_port(&self) -> bool {
        matches!(self, AppKind::Streamlit)
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AppKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "python" => AppKind::Python,
            "streamlit" => AppKind::Streamlit,
            "service" => AppKind::Service,
            _ => AppKind::Unknown,
        })
    }
}

/// How to launch an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Entry file relative to the snapshot root.
    pub entry_file: String,
    /// Environment variables for the process.
    #[serde(default, deserialize_with = "string_map")]
    pub env: BTreeMap<String, String>,
    /// Arguments passed after the entry file.
    #[serde(default, deserialize_with = "string_list")]
    pub cli_args: Vec<String>,
}

/// One declared application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDeclaration {
    /// Optional icon identifier shown by front-ends.
    #[serde(default)]
    pub app_icon: Option<String>,
    /// Application kind.
    #[serde(rename = "type")]
    pub kind: AppKind,
    /// Launch configuration.
    pub config: RuntimeConfig,
}

impl AppDeclaration {
    /// The declaration used when a snapshot has no usable declaration file.
    pub fn fallback() -> Self {
        Self {
            app_icon: None,
            kind: AppKind::Streamlit,
            config: RuntimeConfig {
                entry_file: "main.py".to_string(),
                env: BTreeMap::new(),
                cli_args: Vec::new(),
            },
        }
    }
}

/// Provenance information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Upstream the repository was imported from.
    #[serde(default)]
    pub imported_from: Option<String>,
}

/// Parsed declaration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Applications keyed by name.
    #[serde(default)]
    pub apps: BTreeMap<String, AppDeclaration>,
    /// Optional metadata block.
    #[serde(default)]
    pub metadata: Option<ManifestMetadata>,
}

impl Manifest {
    /// Parse a declaration file.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(ManifestError::Empty);
        }
        let manifest: Option<Manifest> = serde_yaml::from_slice(bytes)?;
        match manifest {
            Some(manifest) if !manifest.apps.is_empty() => Ok(manifest),
            _ => Err(ManifestError::Empty),
        }
    }

    /// Single streamlit app named after the repository.
    pub fn default_for(repo_name: &str) -> Self {
        Self {
            apps: BTreeMap::from([(repo_name.to_string(), AppDeclaration::fallback())]),
            metadata: None,
        }
    }

    /// Parse `bytes`, falling back to the default declaration when the file
    /// is missing or invalid.
    pub fn load_or_default(bytes: Option<&[u8]>, repo_name: &str) -> Self {
        let Some(bytes) = bytes else {
            return Self::default_for(repo_name);
        };
        match Self::parse(bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(repo = %repo_name, error = %e, "Using default app declaration");
                Self::default_for(repo_name)
            }
        }
    }

    /// Serialize back to YAML.
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => serde_yaml::to_string(&other)
            .ok()
            .map(|s| s.trim_end().to_string()),
    }
}

fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k, v)))
        .collect())
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(scalar_to_string)
        .collect())
}

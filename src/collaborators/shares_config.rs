//! YAML-backed share configuration.
//!
//! ```yaml
//! default_share: 1.0
//! groups:
//!   biomed_user:
//!     share: 4.0
//!   lhcb_prod:
//!     share: 10.0
//!     pooled: true
//!     allow_background: true
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CollaboratorError;

use super::{ShareConfig, DEFAULT_GROUP_SHARE};

/// Per-group entry of the share table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupShareEntry {
    /// Share of the group; the table default applies when omitted.
    #[serde(default)]
    pub share: Option<f64>,
    /// One share for the whole group regardless of identity.
    #[serde(default)]
    pub pooled: bool,
    /// Queues with a mean job priority at or below the background
    /// threshold only get the minimum share.
    #[serde(default)]
    pub allow_background: bool,
}

/// On-disk layout of the share table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareConfigFile {
    #[serde(default = "default_share")]
    pub default_share: f64,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupShareEntry>,
}

fn default_share() -> f64 {
    DEFAULT_GROUP_SHARE
}

impl Default for ShareConfigFile {
    fn default() -> Self {
        Self {
            default_share: DEFAULT_GROUP_SHARE,
            groups: BTreeMap::new(),
        }
    }
}

impl ShareConfigFile {
    fn validate(&self) -> Result<(), CollaboratorError> {
        let mut shares = std::iter::once(("default", self.default_share)).chain(
            self.groups
                .iter()
                .filter_map(|(name, entry)| entry.share.map(|share| (name.as_str(), share))),
        );
        match shares.find(|(_, share)| !share.is_finite() || *share < 0.0) {
            Some((name, share)) => Err(CollaboratorError::ConfigUnavailable(format!(
                "share of '{}' must be a non-negative number, got {}",
                name, share
            ))),
            None => Ok(()),
        }
    }
}

/// Share table held in memory, optionally backed by a YAML file.
#[derive(Debug, Default)]
pub struct StaticShareConfig {
    path: Option<PathBuf>,
    table: RwLock<ShareConfigFile>,
}

impl StaticShareConfig {
    /// Creates an empty table where every group gets `default_share`.
    pub fn new(default_share: f64) -> Self {
        Self {
            path: None,
            table: RwLock::new(ShareConfigFile {
                default_share,
                groups: BTreeMap::new(),
            }),
        }
    }

    /// Parses a table from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, CollaboratorError> {
        let table: ShareConfigFile = serde_yaml::from_str(text)?;
        table.validate()?;
        Ok(Self {
            path: None,
            table: RwLock::new(table),
        })
    }

    /// Loads a table from a YAML file; [`StaticShareConfig::reload`] re-reads it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CollaboratorError> {
        let path = path.as_ref().to_path_buf();
        let table = read_table(&path)?;
        Ok(Self {
            path: Some(path),
            table: RwLock::new(table),
        })
    }

    /// Adds or replaces a group entry.
    pub fn with_group(self, group: impl Into<String>, share: f64, pooled: bool) -> Self {
        self.set_group(
            group,
            GroupShareEntry {
                share: Some(share),
                pooled,
                allow_background: false,
            },
        );
        self
    }

    /// Replaces a group entry at runtime.
    pub fn set_group(&self, group: impl Into<String>, entry: GroupShareEntry) {
        self.table.write().groups.insert(group.into(), entry);
    }

    /// Re-reads the backing file. Returns false when there is no file.
    pub fn reload(&self) -> Result<bool, CollaboratorError> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let table = read_table(path)?;
        info!(path = %path.display(), groups = table.groups.len(), "Reloaded share table");
        *self.table.write() = table;
        Ok(true)
    }

    fn entry(&self, group: &str) -> (f64, Option<GroupShareEntry>) {
        let table = self.table.read();
        (table.default_share, table.groups.get(group).cloned())
    }
}

fn read_table(path: &Path) -> Result<ShareConfigFile, CollaboratorError> {
    let text = std::fs::read_to_string(path)?;
    let table: ShareConfigFile = serde_yaml::from_str(&text)?;
    table.validate()?;
    Ok(table)
}

#[async_trait]
impl ShareConfig for StaticShareConfig {
    async fn share(&self, group: &str) -> Result<f64, CollaboratorError> {
        let (default, entry) = self.entry(group);
        Ok(entry.and_then(|entry| entry.share).unwrap_or(default))
    }

    async fn is_pooled(&self, group: &str) -> Result<bool, CollaboratorError> {
        Ok(self.entry(group).1.is_some_and(|entry| entry.pooled))
    }

    async fn all_groups(&self) -> Result<BTreeSet<String>, CollaboratorError> {
        let table = self.table.read();
        Ok(table.groups.keys().cloned().collect())
    }

    async fn allows_background_queues(&self, group: &str) -> Result<bool, CollaboratorError> {
        Ok(self.entry(group).1.is_some_and(|entry| entry.allow_background))
    }

    async fn refresh_source(&self) -> Result<(), CollaboratorError> {
        StaticShareConfig::reload(self).map(|_| ())
    }
}

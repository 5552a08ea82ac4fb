//! External collaborators consumed by the scheduler.
//!
//! The share configuration service and the accounting service are black
//! boxes reached through [`ShareConfig`] and [`UsageReporter`]. This module
//! also ships default implementations: a YAML-backed share table, a
//! YAML usage export reader and an in-memory usage report.

pub mod accounting;
pub mod shares_config;
pub mod usage_file;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CollaboratorError;

pub use accounting::InMemoryUsageReporter;
pub use shares_config::{GroupShareEntry, ShareConfigFile, StaticShareConfig};
pub use usage_file::{FileUsageReporter, UsageFile, WindowUsage};

/// Share assumed for groups with no configured value.
pub const DEFAULT_GROUP_SHARE: f64 = 1.0;

/// Source of per-group fair-share configuration.
#[async_trait]
pub trait ShareConfig: Send + Sync {
    /// Configured share of `group`, or the default share when unset.
    async fn share(&self, group: &str) -> Result<f64, CollaboratorError>;

    /// Whether the group pools all its members under one share.
    async fn is_pooled(&self, group: &str) -> Result<bool, CollaboratorError>;

    /// Every group with an explicit configuration entry.
    async fn all_groups(&self) -> Result<BTreeSet<String>, CollaboratorError>;

    /// Whether low-priority queues of the group run as background queues.
    async fn allows_background_queues(&self, _group: &str) -> Result<bool, CollaboratorError> {
        Ok(false)
    }

    /// Re-reads the backing source, if the implementation has one.
    async fn refresh_source(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// How usage samples are keyed by the accounting service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UsageGrouping {
    /// One entry per owner group, across all groups.
    ByGroup,
    /// One entry per owner identity, restricted to one group.
    ByIdentityInGroup(String),
}

impl UsageGrouping {
    /// Stable key, used in logs and by the in-memory reporter.
    pub fn key(&self) -> String {
        match self {
            UsageGrouping::ByGroup => "group".to_string(),
            UsageGrouping::ByIdentityInGroup(group) => format!("identity@{}", group),
        }
    }
}

impl fmt::Display for UsageGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Source of historical usage samples.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Average number of concurrently running jobs per entity over the
    /// trailing `span` ending now.
    async fn average_running_count(
        &self,
        span: Duration,
        grouping: &UsageGrouping,
    ) -> Result<HashMap<String, f64>, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouping_keys_are_distinct() {
        assert_eq!(UsageGrouping::ByGroup.key(), "group");
        let a = UsageGrouping::ByIdentityInGroup("a".to_string());
        let b = UsageGrouping::ByIdentityInGroup("b".to_string());
        assert_ne!(a.key(), b.key());
        assert_eq!(a.to_string(), "identity@a");
    }
}

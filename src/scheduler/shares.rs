//! Fair-share computation.
//!
//! [`ShareCalculator::recalculate`] turns a group's configured share into a
//! priority for every task queue the group owns. Pooled groups spread one
//! share over all their queues; other groups split it evenly between owner
//! identities first. Within an entity, queues get a slice proportional to the
//! summed effective priority of their jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::collaborators::ShareConfig;
use crate::error::{CollaboratorError, SchedulerError};
use crate::metrics::MetricsCollector;
use crate::storage::{QueueLoad, TaskQueueStore};
use crate::taskqueue::TaskQueueId;

use super::history::SharesCorrector;

/// Share settings of one group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupShare {
    pub share: f64,
    pub pooled: bool,
    pub allow_background: bool,
}

/// Snapshot of the configured group shares.
///
/// [`GroupShareCache::refresh`] resolves the share of every configured group
/// and of every group still owning queues, then reports whether anything
/// differs from the previous snapshot. Groups without an entry resolve
/// through the table default, so a default change shows up as a difference.
/// The periodic sweep uses this to decide whether to recompute.
pub struct GroupShareCache {
    config: Arc<dyn ShareConfig>,
    snapshot: RwLock<BTreeMap<String, GroupShare>>,
}

impl GroupShareCache {
    /// Creates an empty cache. Call [`GroupShareCache::refresh`] to fill it.
    pub fn new(config: Arc<dyn ShareConfig>) -> Self {
        Self {
            config,
            snapshot: RwLock::new(BTreeMap::new()),
        }
    }

    /// Re-reads the configuration for the configured groups plus `in_use`.
    /// Returns true if the snapshot changed.
    pub async fn refresh(&self, in_use: &BTreeSet<String>) -> Result<bool, CollaboratorError> {
        self.config.refresh_source().await?;
        let mut groups = self.config.all_groups().await?;
        groups.extend(in_use.iter().cloned());

        let mut fresh = BTreeMap::new();
        for group in groups {
            let share = self.fetch(&group).await?;
            fresh.insert(group, share);
        }

        let mut snapshot = self.snapshot.write();
        if *snapshot == fresh {
            return Ok(false);
        }
        *snapshot = fresh;
        Ok(true)
    }

    /// Share settings of `group`, from the snapshot when present.
    pub async fn lookup(&self, group: &str) -> Result<GroupShare, CollaboratorError> {
        let cached = self.snapshot.read().get(group).copied();
        match cached {
            Some(share) => Ok(share),
            None => self.fetch(group).await,
        }
    }

    /// Groups in the current snapshot.
    pub fn groups(&self) -> BTreeSet<String> {
        self.snapshot.read().keys().cloned().collect()
    }

    async fn fetch(&self, group: &str) -> Result<GroupShare, CollaboratorError> {
        Ok(GroupShare {
            share: self.config.share(group).await?,
            pooled: self.config.is_pooled(group).await?,
            allow_background: self.config.allows_background_queues(group).await?,
        })
    }
}

/// Computes and persists task-queue priorities from fair shares.
pub struct ShareCalculator {
    store: Arc<dyn TaskQueueStore>,
    shares: Arc<GroupShareCache>,
    corrector: Option<Arc<SharesCorrector>>,
    min_queue_share: f64,
    background_threshold: f64,
    metrics: MetricsCollector,
}

impl ShareCalculator {
    /// Creates a calculator without history correction.
    pub fn new(
        store: Arc<dyn TaskQueueStore>,
        shares: Arc<GroupShareCache>,
        min_queue_share: f64,
        background_threshold: f64,
    ) -> Self {
        Self {
            store,
            shares,
            corrector: None,
            min_queue_share,
            background_threshold,
            metrics: MetricsCollector::new(),
        }
    }

    /// Enables history correction.
    pub fn with_corrector(mut self, corrector: Arc<SharesCorrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Sets the metrics collector.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// The group share cache this calculator reads.
    pub fn share_cache(&self) -> &Arc<GroupShareCache> {
        &self.shares
    }

    /// Refreshes the share snapshot over the configured groups and every
    /// group currently owning task queues.
    pub async fn refresh_shares(&self) -> Result<bool, SchedulerError> {
        let in_use = self.store.groups_in_queues().await?;
        Ok(self.shares.refresh(&in_use).await?)
    }

    /// The history corrector, when correction is configured.
    pub fn corrector(&self) -> Option<&Arc<SharesCorrector>> {
        self.corrector.as_ref()
    }

    /// Recomputes the priority of every task queue owned by `group`.
    ///
    /// Returns the number of task queues updated. Safe to call redundantly:
    /// the result only depends on the store contents, the configuration and
    /// the correction data.
    pub async fn recalculate(&self, group: &str) -> Result<usize, SchedulerError> {
        let settings = self.shares.lookup(group).await?;
        let share = self.group_share(group, settings.share).await?;

        let entities: Vec<(Option<String>, f64)> = if settings.pooled {
            vec![(None, share)]
        } else {
            let owners = self.store.owners_in_group(group).await?;
            if owners.is_empty() {
                return Ok(0);
            }
            let per_owner = share / owners.len() as f64;
            let expected: BTreeMap<String, f64> =
                owners.into_iter().map(|owner| (owner, per_owner)).collect();
            let corrected = match &self.corrector {
                Some(corrector) => corrector.correct_identities(group, &expected),
                None => expected,
            };
            corrected
                .into_iter()
                .map(|(owner, share)| (Some(owner), share))
                .collect()
        };

        let mut priorities = Vec::new();
        for (identity, share) in &entities {
            let loads = self.store.queue_loads(group, identity.as_deref()).await?;
            priorities.extend(distribute_share(
                &loads,
                *share,
                settings.allow_background.then_some(self.background_threshold),
                self.min_queue_share,
            ));
        }

        self.store.set_priorities(&priorities).await?;
        self.metrics.record_recalculation();
        debug!(
            group = %group,
            share = share,
            entities = entities.len(),
            queues = priorities.len(),
            "Recalculated task queue priorities"
        );
        Ok(priorities.len())
    }

    /// Recomputes every group that owns task queues.
    ///
    /// Returns the number of groups recomputed.
    pub async fn recalculate_all(&self) -> Result<usize, SchedulerError> {
        let groups = self.store.groups_in_queues().await?;
        for group in &groups {
            self.recalculate(group).await?;
        }
        info!(groups = groups.len(), "Recalculated all group shares");
        Ok(groups.len())
    }

    /// Applies the group-level correction against every competing group.
    async fn group_share(&self, group: &str, configured: f64) -> Result<f64, SchedulerError> {
        let Some(corrector) = self.corrector.as_ref().filter(|c| c.is_enabled()) else {
            return Ok(configured);
        };

        let mut expected = BTreeMap::new();
        for other in self.store.groups_in_queues().await? {
            if other != group {
                let share = self.shares.lookup(&other).await?.share;
                expected.insert(other, share);
            }
        }
        expected.insert(group.to_string(), configured);

        let corrected = corrector.correct_groups(&expected);
        Ok(corrected.get(group).copied().unwrap_or(configured))
    }
}

/// Splits an entity's share across its task queues.
///
/// Each queue gets `share * priority_sum / total`. With a background
/// threshold, queues whose mean job priority is at or below it are left out
/// of the split. Every result is floored at `min_share`.
pub fn distribute_share(
    loads: &[QueueLoad],
    share: f64,
    background_threshold: Option<f64>,
    min_share: f64,
) -> Vec<(TaskQueueId, f64)> {
    let is_background = |load: &QueueLoad| {
        background_threshold.is_some_and(|threshold| load.mean_priority() <= threshold)
    };

    let total: f64 = loads
        .iter()
        .filter(|load| !is_background(load))
        .map(|load| load.priority_sum)
        .sum();

    loads
        .iter()
        .map(|load| {
            let priority = if is_background(load) || total <= 0.0 {
                min_share
            } else {
                (share * load.priority_sum / total).max(min_share)
            };
            (load.task_queue_id, priority)
        })
        .collect()
}

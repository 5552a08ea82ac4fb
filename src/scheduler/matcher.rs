//! Job extraction.
//!
//! A match lists the enabled task queues admitted by the capability filter,
//! orders them by CPU time and a priority-weighted draw, and walks them until
//! one job is removed. Losing a removal race to another matcher is expected
//! and simply moves on to the next job, queue, or attempt.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;
use crate::storage::{CandidateQueue, TaskQueueStore};
use crate::taskqueue::{MatchFilter, MatchedJob};

use super::sampling::{pick_weighted, rank_candidates};
use super::shares::ShareCalculator;

/// Result of a match request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(MatchedJob),
    NoMatch,
}

impl MatchOutcome {
    /// The extracted job, if any.
    pub fn job(&self) -> Option<&MatchedJob> {
        match self {
            MatchOutcome::Matched(job) => Some(job),
            MatchOutcome::NoMatch => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched(_))
    }
}

/// Extraction tuning.
#[derive(Debug, Clone, Copy)]
pub struct MatcherSettings {
    pub attempts: u32,
    pub candidate_limit: usize,
    pub job_batch_size: usize,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            candidate_limit: 10,
            job_batch_size: 10,
        }
    }
}

/// Extracts one job per call from the queues a resource can run.
pub struct Matcher {
    store: Arc<dyn TaskQueueStore>,
    calculator: Arc<ShareCalculator>,
    settings: MatcherSettings,
    rng: Mutex<ChaCha8Rng>,
    metrics: MetricsCollector,
}

impl Matcher {
    /// Creates a matcher. A seed makes every draw reproducible.
    pub fn new(
        store: Arc<dyn TaskQueueStore>,
        calculator: Arc<ShareCalculator>,
        settings: MatcherSettings,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            store,
            calculator,
            settings,
            rng: Mutex::new(rng),
            metrics: MetricsCollector::new(),
        }
    }

    /// Ranked candidate queues for a filter, at most `candidate_limit`.
    pub async fn list_candidates(
        &self,
        filter: &MatchFilter,
    ) -> Result<Vec<CandidateQueue>, SchedulerError> {
        let candidates = self.store.matching_queues(filter).await?;
        let mut rng = self.rng.lock();
        Ok(rank_candidates(
            candidates,
            self.settings.candidate_limit,
            &mut *rng,
        ))
    }

    /// Extracts exactly one job, or reports that none could be taken.
    pub async fn extract(&self, filter: &MatchFilter) -> Result<MatchOutcome, SchedulerError> {
        for attempt in 1..=self.settings.attempts {
            let candidates = self.list_candidates(filter).await?;
            if candidates.is_empty() {
                debug!(attempt, "No candidate task queues");
                return Ok(MatchOutcome::NoMatch);
            }

            for candidate in &candidates {
                if let Some(job_id) = self.take_from(candidate).await? {
                    self.after_extraction(candidate).await;
                    return Ok(MatchOutcome::Matched(MatchedJob {
                        job_id,
                        task_queue_id: candidate.task_queue_id,
                        owner_identity: candidate.owner_identity.clone(),
                        owner_group: candidate.owner_group.clone(),
                    }));
                }
            }

            debug!(
                attempt,
                candidates = candidates.len(),
                "Every candidate lost its jobs to concurrent matches"
            );
        }

        Ok(MatchOutcome::NoMatch)
    }

    /// Tries to remove one job from a queue. `None` means the queue had
    /// nothing left for us.
    async fn take_from(
        &self,
        candidate: &CandidateQueue,
    ) -> Result<Option<String>, SchedulerError> {
        let id = candidate.task_queue_id;
        let classes = self.store.priority_classes(id).await?;
        if classes.is_empty() {
            self.cleanup_empty(candidate).await;
            return Ok(None);
        }

        let winner = {
            let contributions: Vec<f64> = classes.iter().map(|c| c.contribution()).collect();
            let mut rng = self.rng.lock();
            pick_weighted(&contributions, &mut *rng).unwrap_or(0)
        };
        let priority = classes[winner].effective_priority;

        let mut batch = self
            .store
            .jobs_with_priority(id, priority, self.settings.job_batch_size)
            .await?;

        while !batch.is_empty() {
            let job_id = {
                let mut rng = self.rng.lock();
                let idx = rng.random_range(0..batch.len());
                batch.swap_remove(idx)
            };
            if self.store.remove_job(&job_id).await?.removed {
                return Ok(Some(job_id));
            }
            debug!(job_id = %job_id, task_queue_id = id, "Job taken by a concurrent match");
        }

        Ok(None)
    }

    /// Drops the queue and recomputes its group if the last job just left.
    async fn after_extraction(&self, candidate: &CandidateQueue) {
        let id = candidate.task_queue_id;
        match self.store.count_jobs(id).await {
            Ok(0) => self.cleanup_empty(candidate).await,
            Ok(_) => {}
            Err(e) => warn!(task_queue_id = id, error = %e, "Could not count remaining jobs"),
        }
    }

    /// Lazy delete of an empty queue, then a recompute of its group.
    /// Failures are logged and never abort a match.
    async fn cleanup_empty(&self, candidate: &CandidateQueue) {
        let id = candidate.task_queue_id;
        match self.store.delete_if_empty(id).await {
            Ok(true) => {
                self.metrics.record_queues_deleted(1);
                debug!(task_queue_id = id, "Deleted empty task queue");
                if let Err(e) = self.calculator.recalculate(&candidate.owner_group).await {
                    warn!(
                        group = %candidate.owner_group,
                        error = %e,
                        "Share recalculation after queue deletion failed"
                    );
                }
            }
            Ok(false) => {}
            Err(e) => warn!(task_queue_id = id, error = %e, "Empty task queue cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticShareConfig;
    use crate::scheduler::shares::GroupShareCache;
    use crate::storage::MemoryTaskQueueStore;
    use crate::taskqueue::{Capabilities, MultiValueField, TaskQueueDefinition};
    use std::collections::BTreeSet;

    fn matcher(store: Arc<MemoryTaskQueueStore>, seed: u64) -> Matcher {
        let cache = Arc::new(GroupShareCache::new(Arc::new(StaticShareConfig::new(1.0))));
        let calculator = Arc::new(ShareCalculator::new(store.clone(), cache, 0.001, 0.1));
        Matcher::new(store, calculator, MatcherSettings::default(), Some(seed))
    }

    fn filter(caps: Capabilities) -> MatchFilter {
        caps.validate(&BTreeSet::new()).unwrap()
    }

    #[tokio::test]
    async fn test_extracts_each_job_once_then_no_match() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let def = TaskQueueDefinition::new("/CN=a", "g", "S", 5_000);
        let id = store.create(&def, 1.0, true).await.unwrap();
        store.add_job(id, "j1", 10, 10.0).await.unwrap();
        store.add_job(id, "j2", 5, 5.0).await.unwrap();

        let m = matcher(store.clone(), 1);
        let caps = filter(Capabilities::new().with_setup("S").with_cpu_time(5_000));

        let first = m.extract(&caps).await.unwrap();
        let second = m.extract(&caps).await.unwrap();
        let mut ids = vec![
            first.job().unwrap().job_id.clone(),
            second.job().unwrap().job_id.clone(),
        ];
        ids.sort();
        assert_eq!(ids, vec!["j1", "j2"]);

        assert_eq!(m.extract(&caps).await.unwrap(), MatchOutcome::NoMatch);
        assert_eq!(store.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_disabled_queue_is_never_matched() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let def = TaskQueueDefinition::new("/CN=a", "g", "S", 500);
        let id = store.create(&def, 1.0, false).await.unwrap();
        store.add_job(id, "j1", 1, 1.0).await.unwrap();

        let m = matcher(store.clone(), 2);
        let outcome = m.extract(&filter(Capabilities::new())).await.unwrap();
        assert!(!outcome.is_match());
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_site_filter_and_banned_sites() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let open = TaskQueueDefinition::new("/CN=a", "g", "S", 500)
            .with_values(MultiValueField::BannedSites, ["LCG.Bad.org"]);
        let id = store.create(&open, 1.0, true).await.unwrap();
        store.add_job(id, "j1", 1, 1.0).await.unwrap();

        let m = matcher(store.clone(), 3);
        let banned = filter(
            Capabilities::new().with_value(MultiValueField::Sites, "LCG.Bad.org"),
        );
        assert!(m.list_candidates(&banned).await.unwrap().is_empty());

        let good = filter(
            Capabilities::new().with_value(MultiValueField::Sites, "LCG.Good.org"),
        );
        assert_eq!(m.list_candidates(&good).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_candidate_is_cleaned_lazily() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let empty = TaskQueueDefinition::new("/CN=a", "g", "S", 500);
        store.create(&empty, 1.0, true).await.unwrap();

        let m = matcher(store.clone(), 4);
        let outcome = m.extract(&filter(Capabilities::new())).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
        assert_eq!(store.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_high_priority_class_wins_more_often() {
        let store = Arc::new(MemoryTaskQueueStore::new());
        let def = TaskQueueDefinition::new("/CN=a", "g", "S", 500);
        let id = store.create(&def, 1.0, true).await.unwrap();

        let m = matcher(store.clone(), 5);
        let caps = filter(Capabilities::new());
        let trials = 2_000;
        let mut high = 0;
        for trial in 0..trials {
            store.add_job(id, &format!("hi-{}", trial), 3, 3.0).await.unwrap();
            store.add_job(id, &format!("lo-{}", trial), 1, 1.0).await.unwrap();
            let job = m.extract(&caps).await.unwrap();
            if job.job().unwrap().job_id.starts_with("hi-") {
                high += 1;
            }
            // Drain whatever is left so every trial starts from one job each.
            for rest in [format!("hi-{}", trial), format!("lo-{}", trial)] {
                store.remove_job(&rest).await.unwrap();
            }
        }
        let frequency = high as f64 / trials as f64;
        assert!((frequency - 0.75).abs() < 0.05, "frequency {}", frequency);
    }
}

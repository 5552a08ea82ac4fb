//! The externally visible scheduler operations.
//!
//! [`SchedulerFacade`] validates input, runs the insert protocol against the
//! store's enabled-flag compare-and-swap, delegates matching to the
//! [`Matcher`], and triggers share recomputation whenever the set of task
//! queues or job priorities of a group changes.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collaborators::ShareConfig;
use crate::error::{SchedulerError, ValidationError};
use crate::metrics::{InsertOutcome, MatchResult, MetricsCollector};
use crate::storage::{CandidateQueue, QueueFilter, StoreError, TaskQueue, TaskQueueStore};
use crate::taskqueue::{
    Capabilities, CpuSegments, JobRequirements, MatchFilter, PriorityBounds, TaskQueueDefinition,
    TaskQueueId,
};

use super::config::{ConfigError, SchedulerConfig};
use super::history::SharesCorrector;
use super::matcher::{MatchOutcome, Matcher, MatcherSettings};
use super::shares::{GroupShareCache, ShareCalculator};
use super::sweeper::ShareSweeper;

/// Result of a bulk job deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteReport {
    /// Number of jobs removed.
    pub removed: usize,
    /// Job ids that were not queued.
    pub missing: Vec<String>,
    /// Task queues deleted by the cleanup pass.
    pub deleted_queues: Vec<TaskQueueId>,
}

/// Result of a bulk reprioritization.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriorityReport {
    pub updated: usize,
    /// Job ids that were not queued.
    pub unknown: Vec<String>,
}

/// Outcome of one pass of the insert protocol.
enum InsertStep {
    Done(TaskQueueId),
    Contended,
}

/// Entry point for producers, consumers and operators.
pub struct SchedulerFacade {
    config: SchedulerConfig,
    segments: CpuSegments,
    bounds: PriorityBounds,
    store: Arc<dyn TaskQueueStore>,
    calculator: Arc<ShareCalculator>,
    matcher: Matcher,
    metrics: MetricsCollector,
}

impl SchedulerFacade {
    /// Wires the scheduler components together.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if `config` is invalid.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn TaskQueueStore>,
        shares: Arc<dyn ShareConfig>,
        corrector: Option<Arc<SharesCorrector>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let segments = config.segments()?;
        let bounds = config.priority_bounds();
        let metrics = MetricsCollector::new();

        let cache = Arc::new(GroupShareCache::new(shares));
        let mut calculator = ShareCalculator::new(
            Arc::clone(&store),
            cache,
            config.min_queue_share,
            config.background_priority_threshold,
        )
        .with_metrics(metrics.clone());
        if let Some(corrector) = corrector {
            calculator = calculator.with_corrector(corrector);
        }
        let calculator = Arc::new(calculator);

        let matcher = Matcher::new(
            Arc::clone(&store),
            Arc::clone(&calculator),
            MatcherSettings {
                attempts: config.match_attempts,
                candidate_limit: config.candidate_limit,
                job_batch_size: config.job_batch_size,
            },
            config.rng_seed,
        );

        Ok(Self {
            config,
            segments,
            bounds,
            store,
            calculator,
            matcher,
            metrics,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn calculator(&self) -> &Arc<ShareCalculator> {
        &self.calculator
    }

    /// A stopped share sweeper running at the configured interval.
    pub fn sweeper(&self) -> ShareSweeper {
        ShareSweeper::new(
            Arc::clone(&self.calculator),
            self.config.share_sweep_interval,
        )
    }

    /// Queues a job, creating its task queue when none is equivalent.
    ///
    /// Returns the task queue the job landed in.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Validation` for malformed requirements.
    /// - `SchedulerError::Busy` when the task queue stayed contended for
    ///   every attempt.
    /// - `SchedulerError::Store` on storage failure.
    pub async fn insert_job(
        &self,
        job_id: &str,
        requirements: &JobRequirements,
        submitted_priority: i64,
    ) -> Result<TaskQueueId, SchedulerError> {
        let definition = match self.validate_insert(job_id, requirements) {
            Ok(definition) => definition,
            Err(e) => {
                self.metrics.record_insert(InsertOutcome::Rejected);
                return Err(e.into());
            }
        };
        let effective = self.bounds.effective(submitted_priority);
        let attempts = self.config.insert_max_retries;

        for attempt in 1..=attempts {
            match self
                .insert_once(job_id, &definition, submitted_priority, effective)
                .await?
            {
                InsertStep::Done(id) => {
                    self.metrics.record_insert(InsertOutcome::Inserted);
                    debug!(job_id = %job_id, task_queue_id = id, attempt, "Job inserted");
                    return Ok(id);
                }
                InsertStep::Contended => {
                    self.metrics.record_contention_retry();
                    debug!(job_id = %job_id, attempt, "Task queue contended, retrying");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.insert_retry_delay).await;
                    }
                }
            }
        }

        self.metrics.record_insert(InsertOutcome::Busy);
        warn!(job_id = %job_id, attempts, "Giving up insert after repeated contention");
        Err(SchedulerError::Busy { attempts })
    }

    fn validate_insert(
        &self,
        job_id: &str,
        requirements: &JobRequirements,
    ) -> Result<TaskQueueDefinition, ValidationError> {
        if job_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("jobId"));
        }
        requirements.to_definition(&self.segments)
    }

    async fn insert_once(
        &self,
        job_id: &str,
        definition: &TaskQueueDefinition,
        submitted: i64,
        effective: f64,
    ) -> Result<InsertStep, SchedulerError> {
        match self.store.find(definition).await? {
            Some(id) => self.insert_into_existing(id, job_id, submitted, effective).await,
            None => self.insert_into_new(definition, job_id, submitted, effective).await,
        }
    }

    async fn insert_into_existing(
        &self,
        id: TaskQueueId,
        job_id: &str,
        submitted: i64,
        effective: f64,
    ) -> Result<InsertStep, SchedulerError> {
        if !self.store.set_enabled(id, true, false).await?.changed {
            return Ok(InsertStep::Contended);
        }

        let added = self.store.add_job(id, job_id, submitted, effective).await;
        self.reenable(id).await?;
        match added {
            Ok(()) => Ok(InsertStep::Done(id)),
            // Deleted between find and the gate: start over.
            Err(StoreError::UnknownTaskQueue(_)) => Ok(InsertStep::Contended),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert_into_new(
        &self,
        definition: &TaskQueueDefinition,
        job_id: &str,
        submitted: i64,
        effective: f64,
    ) -> Result<InsertStep, SchedulerError> {
        let id = match self
            .store
            .create(definition, self.config.initial_queue_priority, false)
            .await
        {
            Ok(id) => id,
            Err(StoreError::DuplicateDefinition) => return Ok(InsertStep::Contended),
            Err(e) => return Err(e.into()),
        };
        self.metrics.record_queue_created();
        info!(
            task_queue_id = id,
            owner_group = %definition.owner_group,
            cpu_time = definition.cpu_time,
            "Created task queue"
        );

        if let Err(e) = self.store.add_job(id, job_id, submitted, effective).await {
            self.abandon_new_queue(id).await;
            return Err(e.into());
        }

        if let Err(e) = self.calculator.recalculate(&definition.owner_group).await {
            warn!(
                group = %definition.owner_group,
                error = %e,
                "Share recalculation after queue creation failed"
            );
        }

        self.reenable(id).await?;
        Ok(InsertStep::Done(id))
    }

    async fn reenable(&self, id: TaskQueueId) -> Result<(), SchedulerError> {
        if !self.store.set_enabled(id, false, true).await?.changed {
            warn!(task_queue_id = id, "Task queue was re-enabled by someone else");
        }
        Ok(())
    }

    /// Removes a queue that was created for a job that could not be added.
    async fn abandon_new_queue(&self, id: TaskQueueId) {
        let result = match self.store.set_enabled(id, false, true).await {
            Ok(_) => self.store.delete_if_empty(id).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => self.metrics.record_queues_deleted(1),
            Ok(false) => {}
            Err(e) => warn!(task_queue_id = id, error = %e, "Could not drop abandoned task queue"),
        }
    }

    /// Extracts one job the described resource can run.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Validation` for malformed capabilities and
    /// `SchedulerError::Store` on storage failure. Finding nothing is
    /// [`MatchOutcome::NoMatch`].
    pub async fn match_job(
        &self,
        capabilities: &Capabilities,
    ) -> Result<MatchOutcome, SchedulerError> {
        let started = Instant::now();
        let filter = match self.validate_capabilities(capabilities) {
            Ok(filter) => filter,
            Err(e) => {
                self.metrics
                    .record_match(MatchResult::Rejected, started.elapsed());
                return Err(e);
            }
        };

        let outcome = self.matcher.extract(&filter).await?;
        match &outcome {
            MatchOutcome::Matched(job) => {
                self.metrics
                    .record_match(MatchResult::Matched, started.elapsed());
                info!(
                    job_id = %job.job_id,
                    task_queue_id = job.task_queue_id,
                    owner_group = %job.owner_group,
                    "Matched job"
                );
            }
            MatchOutcome::NoMatch => {
                self.metrics
                    .record_match(MatchResult::NoMatch, started.elapsed());
                debug!("No job matched");
            }
        }
        Ok(outcome)
    }

    /// Validates a capability description. The offered CPU time is bucketed
    /// with the same segments as job requirements, so both sides compare on
    /// segment boundaries.
    fn validate_capabilities(
        &self,
        capabilities: &Capabilities,
    ) -> Result<MatchFilter, SchedulerError> {
        let mut capabilities = capabilities.clone();
        capabilities.cpu_time = capabilities.cpu_time.map(|t| self.segments.bucket(t));
        Ok(capabilities.validate(&self.config.private_pilot_types)?)
    }

    /// Removes jobs, then deletes the task queues left empty and recomputes
    /// their groups once.
    pub async fn delete_jobs(&self, job_ids: &[String]) -> Result<DeleteReport, SchedulerError> {
        let mut report = DeleteReport::default();
        let mut touched = BTreeSet::new();

        for job_id in job_ids {
            let removed = self.store.remove_job(job_id).await?;
            match removed.task_queue_id {
                Some(id) if removed.removed => {
                    report.removed += 1;
                    touched.insert(id);
                }
                _ => report.missing.push(job_id.clone()),
            }
        }
        self.metrics.record_deleted_jobs(report.removed);

        let mut groups = BTreeSet::new();
        for id in touched {
            let Some(queue) = self.store.get_task_queue(id).await? else {
                continue;
            };
            if queue.jobs == 0 && self.store.delete_if_empty(id).await? {
                report.deleted_queues.push(id);
            }
            groups.insert(queue.definition.owner_group);
        }
        self.metrics.record_queues_deleted(report.deleted_queues.len());

        self.recalculate_groups(&groups).await?;
        info!(
            removed = report.removed,
            missing = report.missing.len(),
            deleted_queues = report.deleted_queues.len(),
            "Deleted jobs"
        );
        Ok(report)
    }

    /// Rewrites job priorities, then recomputes every affected group once.
    pub async fn modify_priorities(
        &self,
        updates: &[(String, i64)],
    ) -> Result<PriorityReport, SchedulerError> {
        let mut report = PriorityReport::default();
        let mut touched = BTreeSet::new();

        for (job_id, priority) in updates {
            let effective = self.bounds.effective(*priority);
            match self
                .store
                .update_job_priority(job_id, *priority, effective)
                .await?
            {
                Some(id) => {
                    report.updated += 1;
                    touched.insert(id);
                }
                None => report.unknown.push(job_id.clone()),
            }
        }

        let mut groups = BTreeSet::new();
        for id in touched {
            if let Some(queue) = self.store.get_task_queue(id).await? {
                groups.insert(queue.definition.owner_group);
            }
        }
        self.recalculate_groups(&groups).await?;

        if !report.unknown.is_empty() {
            warn!(unknown = report.unknown.len(), "Reprioritization skipped unknown jobs");
        }
        Ok(report)
    }

    /// Recomputes the priorities of every group. Returns the group count.
    pub async fn recalculate_all(&self) -> Result<usize, SchedulerError> {
        self.calculator.recalculate_all().await
    }

    /// Task queues passing `filter`, with priority, state and job count.
    pub async fn retrieve_task_queues(
        &self,
        filter: &QueueFilter,
    ) -> Result<Vec<TaskQueue>, SchedulerError> {
        Ok(self.store.list_task_queues(filter).await?)
    }

    /// Ranked candidates for a resource, without extracting anything.
    pub async fn matching_task_queues(
        &self,
        capabilities: &Capabilities,
    ) -> Result<Vec<CandidateQueue>, SchedulerError> {
        let filter = self.validate_capabilities(capabilities)?;
        self.matcher.list_candidates(&filter).await
    }

    /// Deletes every enabled empty task queue. Returns the deleted ids.
    pub async fn clean_orphaned_task_queues(&self) -> Result<Vec<TaskQueueId>, SchedulerError> {
        let mut deleted = Vec::new();
        let mut groups = BTreeSet::new();
        for (id, group) in self.store.empty_queues().await? {
            if self.store.delete_if_empty(id).await? {
                deleted.push(id);
                groups.insert(group);
            }
        }
        self.metrics.record_queues_deleted(deleted.len());
        self.recalculate_groups(&groups).await?;

        if !deleted.is_empty() {
            info!(deleted = deleted.len(), "Cleaned orphaned task queues");
        }
        Ok(deleted)
    }

    /// Owner groups holding at least one task queue.
    pub async fn groups_in_task_queues(&self) -> Result<BTreeSet<String>, SchedulerError> {
        Ok(self.store.groups_in_queues().await?)
    }

    async fn recalculate_groups(&self, groups: &BTreeSet<String>) -> Result<(), SchedulerError> {
        for group in groups {
            self.calculator.recalculate(group).await?;
        }
        Ok(())
    }
}

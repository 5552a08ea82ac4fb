//! In-process task-queue store.
//!
//! Every operation takes the state mutex once and releases it before
//! returning, which gives each call the same atomicity the relational store
//! gets from a transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};

use crate::taskqueue::{Job, MatchFilter, TaskQueueDefinition, TaskQueueId};

use super::store::{
    CandidateQueue, CasOutcome, PriorityClass, QueueFilter, QueueLoad, RemovedJob, StoreError,
    TaskQueue, TaskQueueStore,
};

#[derive(Debug)]
struct StoredQueue {
    definition: TaskQueueDefinition,
    fingerprint: String,
    priority: f64,
    enabled: bool,
    job_ids: BTreeSet<String>,
}

impl StoredQueue {
    fn snapshot(&self, id: TaskQueueId) -> TaskQueue {
        TaskQueue {
            id,
            definition: self.definition.clone(),
            priority: self.priority,
            enabled: self.enabled,
            jobs: self.job_ids.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: TaskQueueId,
    queues: BTreeMap<TaskQueueId, StoredQueue>,
    by_fingerprint: HashMap<String, TaskQueueId>,
    jobs: HashMap<String, Job>,
}

/// Task-queue store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryTaskQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryTaskQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock()
    }

    /// Number of task queues currently stored.
    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    /// Number of jobs currently stored.
    pub fn job_count(&self) -> usize {
        self.state().jobs.len()
    }
}

#[async_trait]
impl TaskQueueStore for MemoryTaskQueueStore {
    async fn find(
        &self,
        definition: &TaskQueueDefinition,
    ) -> Result<Option<TaskQueueId>, StoreError> {
        let fingerprint = definition.fingerprint();
        Ok(self.state().by_fingerprint.get(&fingerprint).copied())
    }

    async fn create(
        &self,
        definition: &TaskQueueDefinition,
        initial_priority: f64,
        enabled: bool,
    ) -> Result<TaskQueueId, StoreError> {
        let fingerprint = definition.fingerprint();
        let mut state = self.state();
        if state.by_fingerprint.contains_key(&fingerprint) {
            return Err(StoreError::DuplicateDefinition);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.by_fingerprint.insert(fingerprint.clone(), id);
        state.queues.insert(
            id,
            StoredQueue {
                definition: definition.clone(),
                fingerprint,
                priority: initial_priority,
                enabled,
                job_ids: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn set_enabled(
        &self,
        id: TaskQueueId,
        expected: bool,
        new_value: bool,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.state();
        let changed = match state.queues.get_mut(&id) {
            Some(queue) if queue.enabled == expected => {
                queue.enabled = new_value;
                true
            }
            _ => false,
        };
        Ok(CasOutcome { changed })
    }

    async fn add_job(
        &self,
        id: TaskQueueId,
        job_id: &str,
        submitted_priority: i64,
        effective_priority: f64,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.jobs.contains_key(job_id) {
            return Err(StoreError::DuplicateJob(job_id.to_string()));
        }
        let queue = state
            .queues
            .get_mut(&id)
            .ok_or(StoreError::UnknownTaskQueue(id))?;
        queue.job_ids.insert(job_id.to_string());
        state.jobs.insert(
            job_id.to_string(),
            Job {
                job_id: job_id.to_string(),
                task_queue_id: id,
                submitted_priority,
                effective_priority,
                inserted_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<RemovedJob, StoreError> {
        let mut state = self.state();
        let Some(job) = state.jobs.remove(job_id) else {
            return Ok(RemovedJob {
                removed: false,
                task_queue_id: None,
            });
        };
        if let Some(queue) = state.queues.get_mut(&job.task_queue_id) {
            queue.job_ids.remove(job_id);
        }
        Ok(RemovedJob {
            removed: true,
            task_queue_id: Some(job.task_queue_id),
        })
    }

    async fn count_jobs(&self, id: TaskQueueId) -> Result<u64, StoreError> {
        Ok(self
            .state()
            .queues
            .get(&id)
            .map_or(0, |queue| queue.job_ids.len() as u64))
    }

    async fn delete_if_empty(&self, id: TaskQueueId) -> Result<bool, StoreError> {
        let mut state = self.state();
        let deletable = state
            .queues
            .get(&id)
            .is_some_and(|queue| queue.enabled && queue.job_ids.is_empty());
        if !deletable {
            return Ok(false);
        }
        if let Some(queue) = state.queues.remove(&id) {
            state.by_fingerprint.remove(&queue.fingerprint);
        }
        Ok(true)
    }

    async fn matching_queues(
        &self,
        filter: &MatchFilter,
    ) -> Result<Vec<CandidateQueue>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .iter()
            .filter(|(_, queue)| queue.enabled && filter.admits(&queue.definition))
            .map(|(id, queue)| CandidateQueue {
                task_queue_id: *id,
                owner_identity: queue.definition.owner_identity.clone(),
                owner_group: queue.definition.owner_group.clone(),
                cpu_time: queue.definition.cpu_time,
                priority: queue.priority,
            })
            .collect())
    }

    async fn priority_classes(&self, id: TaskQueueId) -> Result<Vec<PriorityClass>, StoreError> {
        let state = self.state();
        let Some(queue) = state.queues.get(&id) else {
            return Ok(Vec::new());
        };

        // Positive finite floats order the same as their bit patterns.
        let mut classes: BTreeMap<u64, u64> = BTreeMap::new();
        for job_id in &queue.job_ids {
            if let Some(job) = state.jobs.get(job_id) {
                *classes.entry(job.effective_priority.to_bits()).or_default() += 1;
            }
        }
        Ok(classes
            .into_iter()
            .map(|(bits, jobs)| PriorityClass {
                effective_priority: f64::from_bits(bits),
                jobs,
            })
            .collect())
    }

    async fn jobs_with_priority(
        &self,
        id: TaskQueueId,
        effective_priority: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.state();
        let Some(queue) = state.queues.get(&id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .job_ids
            .iter()
            .filter(|job_id| {
                state
                    .jobs
                    .get(*job_id)
                    .is_some_and(|job| job.effective_priority == effective_priority)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.state().jobs.get(job_id).cloned())
    }

    async fn update_job_priority(
        &self,
        job_id: &str,
        submitted_priority: i64,
        effective_priority: f64,
    ) -> Result<Option<TaskQueueId>, StoreError> {
        let mut state = self.state();
        Ok(state.jobs.get_mut(job_id).map(|job| {
            job.submitted_priority = submitted_priority;
            job.effective_priority = effective_priority;
            job.task_queue_id
        }))
    }

    async fn get_task_queue(&self, id: TaskQueueId) -> Result<Option<TaskQueue>, StoreError> {
        Ok(self.state().queues.get(&id).map(|queue| queue.snapshot(id)))
    }

    async fn list_task_queues(&self, filter: &QueueFilter) -> Result<Vec<TaskQueue>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .iter()
            .filter(|(id, queue)| filter.accepts(**id, &queue.definition))
            .map(|(id, queue)| queue.snapshot(*id))
            .collect())
    }

    async fn owners_in_group(&self, group: &str) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .values()
            .filter(|queue| queue.definition.owner_group == group)
            .map(|queue| queue.definition.owner_identity.clone())
            .collect())
    }

    async fn groups_in_queues(&self) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .values()
            .map(|queue| queue.definition.owner_group.clone())
            .collect())
    }

    async fn queue_loads(
        &self,
        group: &str,
        identity: Option<&str>,
    ) -> Result<Vec<QueueLoad>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue.definition.owner_group == group
                    && identity.is_none_or(|identity| queue.definition.owner_identity == identity)
            })
            .map(|(id, queue)| {
                let priority_sum = queue
                    .job_ids
                    .iter()
                    .filter_map(|job_id| state.jobs.get(job_id))
                    .map(|job| job.effective_priority)
                    .sum();
                QueueLoad {
                    task_queue_id: *id,
                    priority_sum,
                    jobs: queue.job_ids.len() as u64,
                }
            })
            .collect())
    }

    async fn set_priorities(&self, priorities: &[(TaskQueueId, f64)]) -> Result<(), StoreError> {
        let mut state = self.state();
        for (id, priority) in priorities {
            // Queues deleted since the loads were read are skipped.
            if let Some(queue) = state.queues.get_mut(id) {
                queue.priority = *priority;
            }
        }
        Ok(())
    }

    async fn empty_queues(&self) -> Result<Vec<(TaskQueueId, String)>, StoreError> {
        let state = self.state();
        Ok(state
            .queues
            .iter()
            .filter(|(_, queue)| queue.job_ids.is_empty())
            .map(|(id, queue)| (*id, queue.definition.owner_group.clone()))
            .collect())
    }
}

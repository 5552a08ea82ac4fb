//! The task-queue store contract.
//!
//! Every scheduler component reaches durable state through
//! [`TaskQueueStore`]. Each call is atomic on its own; the only
//! concurrency primitives callers may rely on are the compare-and-swap on
//! the `enabled` flag ([`TaskQueueStore::set_enabled`]) and the conditional
//! delete ([`TaskQueueStore::delete_if_empty`]).

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::taskqueue::{Job, MatchFilter, TaskQueueDefinition, TaskQueueId};

use super::migrations::MigrationError;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the backing database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A task queue with an equivalent definition already exists.
    #[error("An equivalent task queue already exists")]
    DuplicateDefinition,

    /// The referenced task queue does not exist.
    #[error("Task queue {0} not found")]
    UnknownTaskQueue(TaskQueueId),

    /// The job id is already present in some task queue.
    #[error("Job '{0}' is already queued")]
    DuplicateJob(String),

    /// Stored data could not be decoded.
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

/// Typed result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasOutcome {
    /// True if the stored value matched the expectation and was replaced.
    pub changed: bool,
}

/// Result of removing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedJob {
    /// False if the job was already gone (another caller won the race).
    pub removed: bool,
    /// Task queue the job belonged to, when it was removed.
    pub task_queue_id: Option<TaskQueueId>,
}

/// An enabled task queue admitted by a capability filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateQueue {
    pub task_queue_id: TaskQueueId,
    pub owner_identity: String,
    pub owner_group: String,
    pub cpu_time: u64,
    pub priority: f64,
}

/// Jobs of one task queue sharing an effective priority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityClass {
    pub effective_priority: f64,
    pub jobs: u64,
}

impl PriorityClass {
    /// Weight of this class in the queue: priority times population.
    pub fn contribution(&self) -> f64 {
        self.effective_priority * self.jobs as f64
    }
}

/// Aggregated job priorities of one task queue, used to split shares.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueLoad {
    pub task_queue_id: TaskQueueId,
    /// Sum of member jobs' effective priorities.
    pub priority_sum: f64,
    pub jobs: u64,
}

impl QueueLoad {
    /// Mean effective priority of the queue's jobs, zero when empty.
    pub fn mean_priority(&self) -> f64 {
        if self.jobs == 0 {
            0.0
        } else {
            self.priority_sum / self.jobs as f64
        }
    }
}

/// A task queue as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueue {
    pub id: TaskQueueId,
    pub definition: TaskQueueDefinition,
    pub priority: f64,
    pub enabled: bool,
    pub jobs: u64,
}

/// Filter criteria for listing task queues.
#[derive(Debug, Default, Clone)]
pub struct QueueFilter {
    /// Filter by owner group.
    pub owner_group: Option<String>,
    /// Filter by owner identity.
    pub owner_identity: Option<String>,
    /// Filter by setup.
    pub setup: Option<String>,
    /// Restrict to explicit task-queue ids.
    pub ids: Option<Vec<TaskQueueId>>,
}

impl QueueFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the owner group filter.
    pub fn with_owner_group(mut self, group: impl Into<String>) -> Self {
        self.owner_group = Some(group.into());
        self
    }

    /// Sets the owner identity filter.
    pub fn with_owner_identity(mut self, identity: impl Into<String>) -> Self {
        self.owner_identity = Some(identity.into());
        self
    }

    /// Sets the setup filter.
    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    /// Restricts the listing to the given ids.
    pub fn with_ids(mut self, ids: Vec<TaskQueueId>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Returns true if a queue with this id and definition passes the filter.
    pub fn accepts(&self, id: TaskQueueId, definition: &TaskQueueDefinition) -> bool {
        self.owner_group
            .as_ref()
            .is_none_or(|group| &definition.owner_group == group)
            && self
                .owner_identity
                .as_ref()
                .is_none_or(|identity| &definition.owner_identity == identity)
            && self
                .setup
                .as_ref()
                .is_none_or(|setup| &definition.setup == setup)
            && self.ids.as_ref().is_none_or(|ids| ids.contains(&id))
    }
}

/// Durable CRUD for task-queue definitions and job membership.
#[async_trait]
pub trait TaskQueueStore: Send + Sync {
    /// Looks up the task queue whose definition is exactly equivalent.
    async fn find(
        &self,
        definition: &TaskQueueDefinition,
    ) -> Result<Option<TaskQueueId>, StoreError>;

    /// Inserts a definition and its multi-value rows atomically.
    ///
    /// Fails with `StoreError::DuplicateDefinition` if an equivalent queue
    /// was created concurrently.
    async fn create(
        &self,
        definition: &TaskQueueDefinition,
        initial_priority: f64,
        enabled: bool,
    ) -> Result<TaskQueueId, StoreError>;

    /// Sets `enabled` to `new_value` only if it currently equals `expected`.
    async fn set_enabled(
        &self,
        id: TaskQueueId,
        expected: bool,
        new_value: bool,
    ) -> Result<CasOutcome, StoreError>;

    /// Adds a job to a task queue.
    async fn add_job(
        &self,
        id: TaskQueueId,
        job_id: &str,
        submitted_priority: i64,
        effective_priority: f64,
    ) -> Result<(), StoreError>;

    /// Removes a job. Removing an absent job is not an error.
    async fn remove_job(&self, job_id: &str) -> Result<RemovedJob, StoreError>;

    /// Counts the jobs of a task queue.
    async fn count_jobs(&self, id: TaskQueueId) -> Result<u64, StoreError>;

    /// Deletes the task queue and its multi-value rows iff it is enabled and
    /// holds no jobs. Returns whether it was deleted.
    async fn delete_if_empty(&self, id: TaskQueueId) -> Result<bool, StoreError>;

    /// Lists the enabled task queues admitted by `filter`, in no particular
    /// order.
    async fn matching_queues(&self, filter: &MatchFilter)
        -> Result<Vec<CandidateQueue>, StoreError>;

    /// Groups the jobs of a task queue by effective priority.
    async fn priority_classes(&self, id: TaskQueueId) -> Result<Vec<PriorityClass>, StoreError>;

    /// Up to `limit` job ids of a task queue with the given effective
    /// priority, ordered by job id ascending.
    async fn jobs_with_priority(
        &self,
        id: TaskQueueId,
        effective_priority: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Fetches a job by id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Rewrites a job's priorities, returning its task queue if it exists.
    async fn update_job_priority(
        &self,
        job_id: &str,
        submitted_priority: i64,
        effective_priority: f64,
    ) -> Result<Option<TaskQueueId>, StoreError>;

    /// Fetches a task queue with its job count.
    async fn get_task_queue(&self, id: TaskQueueId) -> Result<Option<TaskQueue>, StoreError>;

    /// Lists task queues passing `filter`, ordered by id.
    async fn list_task_queues(&self, filter: &QueueFilter) -> Result<Vec<TaskQueue>, StoreError>;

    /// Distinct owner identities holding at least one task queue in `group`.
    async fn owners_in_group(&self, group: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Distinct owner groups holding at least one task queue.
    async fn groups_in_queues(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Per-queue job priority sums for a group, optionally one identity only.
    async fn queue_loads(
        &self,
        group: &str,
        identity: Option<&str>,
    ) -> Result<Vec<QueueLoad>, StoreError>;

    /// Writes recomputed task-queue priorities.
    async fn set_priorities(&self, priorities: &[(TaskQueueId, f64)]) -> Result<(), StoreError>;

    /// Task queues holding no jobs, with their owner group.
    async fn empty_queues(&self) -> Result<Vec<(TaskQueueId, String)>, StoreError>;
}

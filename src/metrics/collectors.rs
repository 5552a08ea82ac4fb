//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`super::init_metrics`] has run, so library
//! users that never export metrics pay nothing beyond a `OnceLock` read.

use std::time::Duration;

use super::prometheus::{
    CONTENTION_RETRIES_TOTAL, JOBS_DELETED_TOTAL, JOBS_INSERTED_TOTAL, MATCHES_TOTAL,
    MATCH_LATENCY, RECALCULATIONS_TOTAL, TASK_QUEUES_TOTAL,
};

/// Outcome label of a job insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Busy,
    Rejected,
}

impl InsertOutcome {
    fn label(self) -> &'static str {
        match self {
            InsertOutcome::Inserted => "inserted",
            InsertOutcome::Busy => "busy",
            InsertOutcome::Rejected => "rejected",
        }
    }
}

/// Outcome label of a match request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Matched,
    NoMatch,
    Rejected,
}

impl MatchResult {
    fn label(self) -> &'static str {
        match self {
            MatchResult::Matched => "matched",
            MatchResult::NoMatch => "no_match",
            MatchResult::Rejected => "rejected",
        }
    }
}

/// Metrics collector for scheduler operations.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job insertion attempt.
    pub fn record_insert(&self, outcome: InsertOutcome) {
        if let Some(inserted) = JOBS_INSERTED_TOTAL.get() {
            inserted.with_label_values(&[outcome.label()]).inc();
        }
        tracing::trace!(outcome = outcome.label(), "Recorded insert metric");
    }

    /// Record a match request and how long it took.
    pub fn record_match(&self, result: MatchResult, elapsed: Duration) {
        if let Some(matches) = MATCHES_TOTAL.get() {
            matches.with_label_values(&[result.label()]).inc();
        }
        if let Some(latency) = MATCH_LATENCY.get() {
            latency.observe(elapsed.as_secs_f64());
        }
        tracing::trace!(
            outcome = result.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded match metric"
        );
    }

    /// Record jobs removed by explicit deletion.
    pub fn record_deleted_jobs(&self, count: usize) {
        if let Some(deleted) = JOBS_DELETED_TOTAL.get() {
            deleted.inc_by(count as f64);
        }
    }

    /// Record one contention retry.
    pub fn record_contention_retry(&self) {
        if let Some(retries) = CONTENTION_RETRIES_TOTAL.get() {
            retries.inc();
        }
    }

    /// Record a task queue creation.
    pub fn record_queue_created(&self) {
        if let Some(queues) = TASK_QUEUES_TOTAL.get() {
            queues.with_label_values(&["created"]).inc();
        }
    }

    /// Record task queue deletions.
    pub fn record_queues_deleted(&self, count: usize) {
        if let Some(queues) = TASK_QUEUES_TOTAL.get() {
            queues.with_label_values(&["deleted"]).inc_by(count as f64);
        }
    }

    /// Record one group recalculation.
    pub fn record_recalculation(&self) {
        if let Some(recalculations) = RECALCULATIONS_TOTAL.get() {
            recalculations.inc();
        }
    }
}

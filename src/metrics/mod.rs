//! Prometheus-based monitoring.
//!
//! Counts insertions, matches, contention retries, task queue lifecycle
//! events and recalculations, and times match requests.
//!
//! # Example
//!
//! ```ignore
//! use gridmatch::metrics::{init_metrics, export_metrics};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{InsertOutcome, MatchResult, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    CONTENTION_RETRIES_TOTAL, JOBS_DELETED_TOTAL, JOBS_INSERTED_TOTAL, MATCHES_TOTAL,
    MATCH_LATENCY, RECALCULATIONS_TOTAL, REGISTRY, TASK_QUEUES_TOTAL,
};

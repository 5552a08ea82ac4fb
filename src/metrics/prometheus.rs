//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by gridmatch and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Counter, CounterVec, Encoder, Histogram, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all gridmatch metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Job insertions, labeled by outcome (inserted, busy, rejected).
pub static JOBS_INSERTED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs removed by explicit deletion.
pub static JOBS_DELETED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Match requests, labeled by outcome (matched, no_match, rejected).
pub static MATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Match request latency in seconds.
pub static MATCH_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Retries caused by a lost enabled-flag compare-and-swap or a concurrent create.
pub static CONTENTION_RETRIES_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Task queue lifecycle events, labeled by event (created, deleted).
pub static TASK_QUEUES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Per-group priority recalculations.
pub static RECALCULATIONS_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registration in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_inserted_total = CounterVec::new(
        Opts::new("gridmatch_jobs_inserted_total", "Job insertion attempts by outcome"),
        &["outcome"],
    )?;

    let jobs_deleted_total = Counter::new(
        "gridmatch_jobs_deleted_total",
        "Jobs removed by explicit deletion",
    )?;

    let matches_total = CounterVec::new(
        Opts::new("gridmatch_matches_total", "Match requests by outcome"),
        &["outcome"],
    )?;

    let match_latency = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gridmatch_match_latency_seconds",
            "Match request latency in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    )?;

    let contention_retries_total = Counter::new(
        "gridmatch_contention_retries_total",
        "Insert retries caused by task queue contention",
    )?;

    let task_queues_total = CounterVec::new(
        Opts::new("gridmatch_task_queues_total", "Task queue lifecycle events"),
        &["event"],
    )?;

    let recalculations_total = Counter::new(
        "gridmatch_recalculations_total",
        "Per-group priority recalculations",
    )?;

    registry.register(Box::new(jobs_inserted_total.clone()))?;
    registry.register(Box::new(jobs_deleted_total.clone()))?;
    registry.register(Box::new(matches_total.clone()))?;
    registry.register(Box::new(match_latency.clone()))?;
    registry.register(Box::new(contention_retries_total.clone()))?;
    registry.register(Box::new(task_queues_total.clone()))?;
    registry.register(Box::new(recalculations_total.clone()))?;

    // Already-set cells mean a previous call won; keep its metrics.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_INSERTED_TOTAL.set(jobs_inserted_total);
    let _ = JOBS_DELETED_TOTAL.set(jobs_deleted_total);
    let _ = MATCHES_TOTAL.set(matches_total);
    let _ = MATCH_LATENCY.set(match_latency);
    let _ = CONTENTION_RETRIES_TOTAL.set(contention_retries_total);
    let _ = TASK_QUEUES_TOTAL.set(task_queues_total);
    let _ = RECALCULATIONS_TOTAL.set(recalculations_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        let _ = init_metrics();
        let metrics = export_metrics();
        assert!(!metrics.is_empty());
        assert!(!metrics.starts_with("# Error"));
    }
}

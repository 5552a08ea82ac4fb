//! In-memory usage reporter.
//!
//! Holds precomputed average running counts per window span and grouping.
//! Useful for tests and for deployments that push accounting summaries in
//! rather than having the scheduler pull them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CollaboratorError;

use super::{UsageGrouping, UsageReporter};

type ReportKey = (u64, UsageGrouping);

/// Usage reporter serving samples set through [`InMemoryUsageReporter::set_usage`].
#[derive(Debug, Default)]
pub struct InMemoryUsageReporter {
    reports: RwLock<HashMap<ReportKey, HashMap<String, f64>>>,
    failing: RwLock<HashSet<u64>>,
    requests: AtomicU64,
}

impl InMemoryUsageReporter {
    /// Creates a reporter with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the samples returned for a window span and grouping.
    pub fn set_usage<I, S>(&self, span: Duration, grouping: UsageGrouping, samples: I)
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let samples = samples
            .into_iter()
            .map(|(entity, usage)| (entity.into(), usage))
            .collect();
        self.reports.write().insert((span.as_secs(), grouping), samples);
    }

    /// Makes every request for `span` fail until [`InMemoryUsageReporter::recover`].
    pub fn fail_window(&self, span: Duration) {
        self.failing.write().insert(span.as_secs());
    }

    /// Clears a failure set by [`InMemoryUsageReporter::fail_window`].
    pub fn recover(&self, span: Duration) {
        self.failing.write().remove(&span.as_secs());
    }

    /// Number of requests served so far, failures included.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageReporter for InMemoryUsageReporter {
    async fn average_running_count(
        &self,
        span: Duration,
        grouping: &UsageGrouping,
    ) -> Result<HashMap<String, f64>, CollaboratorError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        if self.failing.read().contains(&span.as_secs()) {
            return Err(CollaboratorError::ReportFailed {
                span,
                reason: "accounting backend unavailable".to_string(),
            });
        }

        Ok(self
            .reports
            .read()
            .get(&(span.as_secs(), grouping.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn test_serves_samples_per_window_and_grouping() {
        let reporter = InMemoryUsageReporter::new();
        reporter.set_usage(DAY, UsageGrouping::ByGroup, [("g1", 10.0), ("g2", 30.0)]);

        let samples = reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .unwrap();
        assert_eq!(samples.get("g2"), Some(&30.0));

        let other = reporter
            .average_running_count(DAY, &UsageGrouping::ByIdentityInGroup("g1".into()))
            .await
            .unwrap();
        assert!(other.is_empty());
        assert_eq!(reporter.requests(), 2);
    }

    #[tokio::test]
    async fn test_failing_window() {
        let reporter = InMemoryUsageReporter::new();
        reporter.fail_window(DAY);
        let err = reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ReportFailed { .. }));

        reporter.recover(DAY);
        assert!(reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .is_ok());
    }
}

//! Historical usage correction of fair shares.
//!
//! A [`HistoryCorrector`] keeps one usage snapshot per configured window and
//! biases expected shares towards entities that ran less than their share.
//! [`SharesCorrector`] holds the group-level corrector plus one
//! per-identity corrector for every group it has seen.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::collaborators::{UsageGrouping, UsageReporter};

use super::config::{HistoryConfig, HistoryWindow};

/// Usage per entity, as served by the accounting collaborator.
pub type UsageSnapshot = HashMap<String, f64>;

#[derive(Debug, Default)]
struct CorrectorState {
    /// One slot per window; `None` until fetched or after a failed refresh.
    snapshots: Vec<Option<UsageSnapshot>>,
    last_refresh: Option<Instant>,
}

impl CorrectorState {
    fn has_usage(&self) -> bool {
        self.snapshots
            .iter()
            .flatten()
            .any(|snapshot| !snapshot.is_empty())
    }
}

/// Usage-based share correction for one grouping of entities.
pub struct HistoryCorrector {
    grouping: UsageGrouping,
    windows: Vec<HistoryWindow>,
    update_period: std::time::Duration,
    global_max_correction: f64,
    reporter: Arc<dyn UsageReporter>,
    state: RwLock<CorrectorState>,
    refresh_gate: Mutex<()>,
}

impl HistoryCorrector {
    /// Creates a corrector with no usage data.
    pub fn new(
        grouping: UsageGrouping,
        config: &HistoryConfig,
        reporter: Arc<dyn UsageReporter>,
    ) -> Self {
        Self {
            grouping,
            windows: config.normalized_windows(),
            update_period: config.update_period(),
            global_max_correction: config.global_max_correction,
            reporter,
            state: RwLock::new(CorrectorState::default()),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Grouping this corrector fetches usage for.
    pub fn grouping(&self) -> &UsageGrouping {
        &self.grouping
    }

    /// Returns true if any window currently holds usage data.
    pub fn has_usage(&self) -> bool {
        self.state.read().has_usage()
    }

    /// Fetches fresh usage snapshots, at most once per update period.
    ///
    /// Concurrent callers serialize on an internal gate, so a burst of
    /// callers triggers a single fetch. A failure on any window discards the
    /// data of every window. Returns true when new data was installed.
    pub async fn refresh(&self) -> bool {
        let _gate = self.refresh_gate.lock().await;

        {
            let state = self.state.read();
            if let Some(last) = state.last_refresh {
                if last.elapsed() < self.update_period {
                    return false;
                }
            }
        }

        let mut fetched = Vec::with_capacity(self.windows.len());
        let mut failure = None;
        for window in &self.windows {
            match self
                .reporter
                .average_running_count(window.time_span(), &self.grouping)
                .await
            {
                Ok(snapshot) => fetched.push(Some(snapshot)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut state = self.state.write();
        state.last_refresh = Some(Instant::now());
        match failure {
            Some(e) => {
                warn!(
                    grouping = %self.grouping,
                    error = %e,
                    "Usage history refresh failed, discarding all windows"
                );
                state.snapshots = vec![None; self.windows.len()];
                false
            }
            None => {
                debug!(grouping = %self.grouping, windows = fetched.len(), "Usage history refreshed");
                state.snapshots = fetched;
                true
            }
        }
    }

    /// Corrects expected shares by recent usage.
    ///
    /// Returns `expected` unchanged when no window holds usage. Otherwise,
    /// for every window with positive usage across the entities of
    /// `expected`, each entity gets a slice factor: its normalized share over
    /// its usage fraction, clamped to the window's bound, times the window
    /// weight. Entities without usage in the window count as maximally
    /// under-served. The summed factor is clamped to the global bound and
    /// scales the original share.
    pub fn apply_correction(&self, expected: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        let state = self.state.read();
        if !state.has_usage() {
            return expected.clone();
        }

        let total_share: f64 = expected.values().sum();
        if total_share <= 0.0 {
            return expected.clone();
        }

        let mut factors: BTreeMap<&str, f64> = BTreeMap::new();
        for (window, snapshot) in self.windows.iter().zip(&state.snapshots) {
            let Some(snapshot) = snapshot else {
                continue;
            };
            let usage_of = |entity: &str| {
                snapshot
                    .get(entity)
                    .copied()
                    .filter(|usage| usage.is_finite() && *usage > 0.0)
            };

            let total_usage: f64 = expected
                .keys()
                .filter_map(|entity| usage_of(entity.as_str()))
                .sum();
            if total_usage <= 0.0 {
                continue;
            }

            let min_factor = 1.0 / window.max_correction;
            for (entity, share) in expected {
                let slice = match usage_of(entity.as_str()) {
                    Some(usage) => {
                        let normalized_share = share / total_share;
                        let usage_fraction = usage / total_usage;
                        (normalized_share / usage_fraction).clamp(min_factor, window.max_correction)
                    }
                    None => window.max_correction,
                };
                *factors.entry(entity.as_str()).or_default() += slice * window.weight;
            }
        }

        let min_global = 1.0 / self.global_max_correction;
        expected
            .iter()
            .map(|(entity, share)| {
                let corrected = match factors.get(entity.as_str()) {
                    Some(factor) => share * factor.clamp(min_global, self.global_max_correction),
                    None => *share,
                };
                (entity.clone(), corrected)
            })
            .collect()
    }

    #[cfg(test)]
    fn install(&self, snapshots: Vec<Option<UsageSnapshot>>) {
        let mut state = self.state.write();
        state.snapshots = snapshots;
        state.last_refresh = Some(Instant::now());
    }
}

/// Group-level and per-identity history correction.
pub struct SharesCorrector {
    config: HistoryConfig,
    reporter: Arc<dyn UsageReporter>,
    groups: HistoryCorrector,
    identities: RwLock<HashMap<String, Arc<HistoryCorrector>>>,
}

impl std::fmt::Debug for SharesCorrector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharesCorrector").finish_non_exhaustive()
    }
}

impl SharesCorrector {
    /// Creates the correctors. Nothing is fetched until [`SharesCorrector::refresh`].
    pub fn new(config: HistoryConfig, reporter: Arc<dyn UsageReporter>) -> Self {
        let groups = HistoryCorrector::new(UsageGrouping::ByGroup, &config, Arc::clone(&reporter));
        Self {
            config,
            reporter,
            groups,
            identities: RwLock::new(HashMap::new()),
        }
    }

    /// Whether correction is applied at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Corrects the shares of competing groups.
    pub fn correct_groups(&self, shares: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
        if !self.is_enabled() {
            return shares.clone();
        }
        self.groups.apply_correction(shares)
    }

    /// Corrects the shares of identities competing inside `group`.
    ///
    /// The first call for a group registers its corrector, which holds no
    /// data until the next refresh.
    pub fn correct_identities(
        &self,
        group: &str,
        shares: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        if !self.is_enabled() {
            return shares.clone();
        }
        self.identity_corrector(group).apply_correction(shares)
    }

    fn identity_corrector(&self, group: &str) -> Arc<HistoryCorrector> {
        if let Some(corrector) = self.identities.read().get(group) {
            return Arc::clone(corrector);
        }

        let mut identities = self.identities.write();
        Arc::clone(identities.entry(group.to_string()).or_insert_with(|| {
            Arc::new(HistoryCorrector::new(
                UsageGrouping::ByIdentityInGroup(group.to_string()),
                &self.config,
                Arc::clone(&self.reporter),
            ))
        }))
    }

    /// Refreshes every corrector. Returns true if any installed new data.
    pub async fn refresh(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let mut refreshed = self.groups.refresh().await;
        let correctors: Vec<Arc<HistoryCorrector>> =
            self.identities.read().values().cloned().collect();
        for corrector in correctors {
            refreshed |= corrector.refresh().await;
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryUsageReporter;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3_600);
    const DAY: Duration = Duration::from_secs(86_400);

    fn shares(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(name, share)| (name.to_string(), *share))
            .collect()
    }

    fn snapshot(entries: &[(&str, f64)]) -> Option<UsageSnapshot> {
        Some(
            entries
                .iter()
                .map(|(name, usage)| (name.to_string(), *usage))
                .collect(),
        )
    }

    fn two_windows() -> HistoryConfig {
        HistoryConfig::default()
            .with_windows(vec![
                HistoryWindow::new(HOUR, 1.0, 2.0),
                HistoryWindow::new(DAY, 1.0, 4.0),
            ])
            .with_global_max_correction(3.0)
            .with_update_period(Duration::ZERO)
    }

    fn corrector(config: &HistoryConfig) -> HistoryCorrector {
        HistoryCorrector::new(
            UsageGrouping::ByGroup,
            config,
            Arc::new(InMemoryUsageReporter::new()),
        )
    }

    #[test]
    fn test_cold_start_is_identity() {
        let corrector = corrector(&two_windows());
        let expected = shares(&[("a", 3.0), ("b", 5.0)]);
        assert_eq!(corrector.apply_correction(&expected), expected);

        // Empty snapshots still count as no data.
        corrector.install(vec![snapshot(&[]), None]);
        assert_eq!(corrector.apply_correction(&expected), expected);
    }

    #[test]
    fn test_fair_usage_keeps_shares() {
        let corrector = corrector(&two_windows());
        corrector.install(vec![
            snapshot(&[("a", 10.0), ("b", 10.0)]),
            snapshot(&[("a", 20.0), ("b", 20.0)]),
        ]);
        let corrected = corrector.apply_correction(&shares(&[("a", 1.0), ("b", 1.0)]));
        assert!((corrected["a"] - 1.0).abs() < 1e-12);
        assert!((corrected["b"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_under_served_entity_is_boosted() {
        let corrector = corrector(&two_windows());
        // a ran 1/4 of the load against a 1/2 share, b ran 3/4.
        corrector.install(vec![
            snapshot(&[("a", 10.0), ("b", 30.0)]),
            snapshot(&[("a", 10.0), ("b", 30.0)]),
        ]);
        let corrected = corrector.apply_correction(&shares(&[("a", 2.0), ("b", 2.0)]));
        // Window factors for a: 2.0 in both; b: 2/3 in both.
        assert!((corrected["a"] - 4.0).abs() < 1e-9);
        assert!((corrected["b"] - 2.0 * (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_mixed_presence_across_windows() {
        let corrector = corrector(&two_windows());
        // b is absent from the hour window and present in the day window.
        corrector.install(vec![
            snapshot(&[("a", 10.0)]),
            snapshot(&[("a", 10.0), ("b", 10.0)]),
        ]);
        let corrected = corrector.apply_correction(&shares(&[("a", 1.0), ("b", 1.0)]));

        // Hour window: a -> clamp(0.5 / 1.0, 0.5, 2) = 0.5, b absent -> 2.0.
        // Day window: both fair -> 1.0.
        // a: 0.5 * 0.5 + 1.0 * 0.5 = 0.75; b: 2.0 * 0.5 + 1.0 * 0.5 = 1.5.
        assert!((corrected["a"] - 0.75).abs() < 1e-9);
        assert!((corrected["b"] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_window_without_usage_of_interest_is_skipped() {
        let corrector = corrector(&two_windows());
        corrector.install(vec![snapshot(&[("other", 50.0)]), None]);
        let expected = shares(&[("a", 1.0), ("b", 2.0)]);
        assert_eq!(corrector.apply_correction(&expected), expected);
    }

    #[test]
    fn test_global_clamp() {
        let config = two_windows().with_global_max_correction(1.5);
        let corrector = corrector(&config);
        corrector.install(vec![snapshot(&[("a", 100.0)]), snapshot(&[("a", 100.0)])]);
        let corrected = corrector.apply_correction(&shares(&[("a", 1.0), ("b", 1.0)]));
        // b is absent everywhere: 2.0 * 0.5 + 4.0 * 0.5 = 3.0, clamped to 1.5.
        assert!((corrected["b"] - 1.5).abs() < 1e-9);
        // a: 0.5 in both windows, clamped to 1 / 1.5.
        assert!((corrected["a"] - 1.0 / 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_refresh_failure_discards_all_windows() {
        let reporter = Arc::new(InMemoryUsageReporter::new());
        reporter.set_usage(HOUR, UsageGrouping::ByGroup, [("a", 1.0)]);
        reporter.set_usage(DAY, UsageGrouping::ByGroup, [("a", 1.0)]);
        let corrector = HistoryCorrector::new(UsageGrouping::ByGroup, &two_windows(), reporter.clone());

        assert!(corrector.refresh().await);
        assert!(corrector.has_usage());

        reporter.fail_window(DAY);
        assert!(!corrector.refresh().await);
        assert!(!corrector.has_usage());
    }

    #[tokio::test]
    async fn test_refresh_respects_update_period() {
        let reporter = Arc::new(InMemoryUsageReporter::new());
        reporter.set_usage(HOUR, UsageGrouping::ByGroup, [("a", 1.0)]);
        let config = two_windows().with_update_period(Duration::from_secs(3_600));
        let corrector = HistoryCorrector::new(UsageGrouping::ByGroup, &config, reporter.clone());

        assert!(corrector.refresh().await);
        let served = reporter.requests();
        assert!(!corrector.refresh().await);
        assert_eq!(reporter.requests(), served);

        // A failed refresh also starts the period.
        let failing = Arc::new(InMemoryUsageReporter::new());
        failing.fail_window(HOUR);
        let corrector = HistoryCorrector::new(UsageGrouping::ByGroup, &config, failing.clone());
        assert!(!corrector.refresh().await);
        let served = failing.requests();
        assert!(!corrector.refresh().await);
        assert_eq!(failing.requests(), served);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_fetches_once() {
        let reporter = Arc::new(InMemoryUsageReporter::new());
        let config = HistoryConfig::default()
            .with_windows(vec![HistoryWindow::new(HOUR, 1.0, 2.0)])
            .with_update_period(Duration::from_secs(3_600));
        let corrector = Arc::new(HistoryCorrector::new(
            UsageGrouping::ByGroup,
            &config,
            reporter.clone(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let corrector = Arc::clone(&corrector);
                tokio::spawn(async move { corrector.refresh().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(reporter.requests(), 1);
    }

    #[tokio::test]
    async fn test_shares_corrector_disabled_is_identity() {
        let reporter = Arc::new(InMemoryUsageReporter::new());
        reporter.set_usage(DAY, UsageGrouping::ByGroup, [("g1", 100.0)]);
        let corrector = SharesCorrector::new(HistoryConfig::disabled(), reporter.clone());

        assert!(!corrector.refresh().await);
        let expected = shares(&[("g1", 1.0), ("g2", 1.0)]);
        assert_eq!(corrector.correct_groups(&expected), expected);
        assert_eq!(reporter.requests(), 0);
    }

    #[tokio::test]
    async fn test_shares_corrector_identity_level() {
        let reporter = Arc::new(InMemoryUsageReporter::new());
        let grouping = UsageGrouping::ByIdentityInGroup("g".to_string());
        reporter.set_usage(DAY, grouping, [("/CN=a", 30.0), ("/CN=b", 10.0)]);
        let config = HistoryConfig::default().with_update_period(Duration::ZERO);
        let corrector = SharesCorrector::new(config, reporter);

        let expected = shares(&[("/CN=a", 0.5), ("/CN=b", 0.5)]);
        // Registered on first use, no data yet.
        assert_eq!(corrector.correct_identities("g", &expected), expected);

        assert!(corrector.refresh().await);
        let corrected = corrector.correct_identities("g", &expected);
        assert!(corrected["/CN=b"] > corrected["/CN=a"]);
    }
}

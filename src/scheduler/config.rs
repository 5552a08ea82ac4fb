//! Scheduler configuration.
//!
//! Covers task-queue bucketing, priority clamping, retry bounds for insert
//! and match, share distribution floors and the history-correction windows.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::taskqueue::{CpuSegments, PriorityBounds, DEFAULT_CPU_SEGMENTS};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the scheduler facade and its components.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Task-queue model
    /// CPU time segment boundaries, ascending.
    pub cpu_segments: Vec<u64>,
    /// Lower bound of the submitted priority clamp.
    pub priority_min: f64,
    /// Upper bound of the submitted priority clamp.
    pub priority_max: f64,
    /// Priority given to a freshly created task queue.
    pub initial_queue_priority: f64,

    // Insert settings
    /// Attempts before an insert fails with a busy error.
    pub insert_max_retries: u32,
    /// Pause between insert attempts after contention.
    pub insert_retry_delay: Duration,

    // Match settings
    /// Full candidate-list attempts per match call.
    pub match_attempts: u32,
    /// Candidate queues considered per attempt.
    pub candidate_limit: usize,
    /// Jobs fetched per winning priority.
    pub job_batch_size: usize,
    /// Pilot types restricted to their owner's task queues.
    pub private_pilot_types: BTreeSet<String>,
    /// Seed for the selection RNG; random when unset.
    pub rng_seed: Option<u64>,

    // Share settings
    /// Floor applied to every recomputed task-queue priority.
    pub min_queue_share: f64,
    /// Mean job priority at or below which a queue counts as background.
    pub background_priority_threshold: f64,
    /// Interval of the periodic share sweep.
    pub share_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_segments: DEFAULT_CPU_SEGMENTS.to_vec(),
            priority_min: 0.001,
            priority_max: 10.0,
            initial_queue_priority: 1.0,

            insert_max_retries: 10,
            insert_retry_delay: Duration::from_millis(100),

            match_attempts: 3,
            candidate_limit: 10,
            job_batch_size: 10,
            private_pilot_types: BTreeSet::from(["private".to_string()]),
            rng_seed: None,

            min_queue_share: 0.001,
            background_priority_threshold: 0.1,
            share_sweep_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GRIDMATCH_CPU_SEGMENTS`: Comma-separated segment boundaries (default: 500,5000,50000,300000)
    /// - `GRIDMATCH_PRIORITY_MIN`: Lower priority clamp (default: 0.001)
    /// - `GRIDMATCH_PRIORITY_MAX`: Upper priority clamp (default: 10)
    /// - `GRIDMATCH_INITIAL_PRIORITY`: Priority of new task queues (default: 1.0)
    /// - `GRIDMATCH_INSERT_RETRIES`: Insert attempts (default: 10)
    /// - `GRIDMATCH_INSERT_RETRY_DELAY_MS`: Delay between insert attempts (default: 100)
    /// - `GRIDMATCH_MATCH_ATTEMPTS`: Match attempts (default: 3)
    /// - `GRIDMATCH_CANDIDATE_LIMIT`: Candidate queues per attempt (default: 10)
    /// - `GRIDMATCH_JOB_BATCH_SIZE`: Jobs fetched per winning priority (default: 10)
    /// - `GRIDMATCH_PRIVATE_PILOT_TYPES`: Comma-separated private pilot types (default: private)
    /// - `GRIDMATCH_RNG_SEED`: Selection RNG seed (default: unset)
    /// - `GRIDMATCH_MIN_QUEUE_SHARE`: Task-queue priority floor (default: 0.001)
    /// - `GRIDMATCH_BACKGROUND_THRESHOLD`: Background queue threshold (default: 0.1)
    /// - `GRIDMATCH_SHARE_SWEEP_SECS`: Share sweep interval (default: 300)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Task-queue model
        if let Ok(val) = std::env::var("GRIDMATCH_CPU_SEGMENTS") {
            config.cpu_segments = parse_env_list(&val, "GRIDMATCH_CPU_SEGMENTS")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_PRIORITY_MIN") {
            config.priority_min = parse_env_value(&val, "GRIDMATCH_PRIORITY_MIN")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_PRIORITY_MAX") {
            config.priority_max = parse_env_value(&val, "GRIDMATCH_PRIORITY_MAX")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_INITIAL_PRIORITY") {
            config.initial_queue_priority = parse_env_value(&val, "GRIDMATCH_INITIAL_PRIORITY")?;
        }

        // Insert settings
        if let Ok(val) = std::env::var("GRIDMATCH_INSERT_RETRIES") {
            config.insert_max_retries = parse_env_value(&val, "GRIDMATCH_INSERT_RETRIES")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_INSERT_RETRY_DELAY_MS") {
            let millis: u64 = parse_env_value(&val, "GRIDMATCH_INSERT_RETRY_DELAY_MS")?;
            config.insert_retry_delay = Duration::from_millis(millis);
        }

        // Match settings
        if let Ok(val) = std::env::var("GRIDMATCH_MATCH_ATTEMPTS") {
            config.match_attempts = parse_env_value(&val, "GRIDMATCH_MATCH_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_CANDIDATE_LIMIT") {
            config.candidate_limit = parse_env_value(&val, "GRIDMATCH_CANDIDATE_LIMIT")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_JOB_BATCH_SIZE") {
            config.job_batch_size = parse_env_value(&val, "GRIDMATCH_JOB_BATCH_SIZE")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_PRIVATE_PILOT_TYPES") {
            config.private_pilot_types = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("GRIDMATCH_RNG_SEED") {
            config.rng_seed = Some(parse_env_value(&val, "GRIDMATCH_RNG_SEED")?);
        }

        // Share settings
        if let Ok(val) = std::env::var("GRIDMATCH_MIN_QUEUE_SHARE") {
            config.min_queue_share = parse_env_value(&val, "GRIDMATCH_MIN_QUEUE_SHARE")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_BACKGROUND_THRESHOLD") {
            config.background_priority_threshold =
                parse_env_value(&val, "GRIDMATCH_BACKGROUND_THRESHOLD")?;
        }

        if let Ok(val) = std::env::var("GRIDMATCH_SHARE_SWEEP_SECS") {
            let secs: u64 = parse_env_value(&val, "GRIDMATCH_SHARE_SWEEP_SECS")?;
            config.share_sweep_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        CpuSegments::new(self.cpu_segments.clone())
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))?;

        if !self.priority_bounds().is_valid() {
            return Err(ConfigError::ValidationFailed(format!(
                "priority bounds must satisfy 0 < min < max, got [{}, {}]",
                self.priority_min, self.priority_max
            )));
        }

        if !(self.initial_queue_priority.is_finite() && self.initial_queue_priority > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "initial_queue_priority must be greater than 0".to_string(),
            ));
        }

        if self.insert_max_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "insert_max_retries must be greater than 0".to_string(),
            ));
        }

        if self.match_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "match_attempts must be greater than 0".to_string(),
            ));
        }

        if self.candidate_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "candidate_limit must be greater than 0".to_string(),
            ));
        }

        if self.job_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_batch_size must be greater than 0".to_string(),
            ));
        }

        if !(self.min_queue_share.is_finite() && self.min_queue_share > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "min_queue_share must be greater than 0".to_string(),
            ));
        }

        if self.background_priority_threshold < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "background_priority_threshold cannot be negative".to_string(),
            ));
        }

        if self.share_sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "share_sweep_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Segment boundaries as a validated sequence.
    pub fn segments(&self) -> Result<CpuSegments, ConfigError> {
        CpuSegments::new(self.cpu_segments.clone())
            .map_err(|e| ConfigError::ValidationFailed(e.to_string()))
    }

    /// Priority clamp range.
    pub fn priority_bounds(&self) -> PriorityBounds {
        PriorityBounds {
            min: self.priority_min,
            max: self.priority_max,
        }
    }

    /// Builder method to set CPU segment boundaries.
    pub fn with_cpu_segments(mut self, segments: Vec<u64>) -> Self {
        self.cpu_segments = segments;
        self
    }

    /// Builder method to set the priority clamp range.
    pub fn with_priority_bounds(mut self, min: f64, max: f64) -> Self {
        self.priority_min = min;
        self.priority_max = max;
        self
    }

    /// Builder method to set insert retries.
    pub fn with_insert_retries(mut self, retries: u32) -> Self {
        self.insert_max_retries = retries;
        self
    }

    /// Builder method to set the insert retry delay.
    pub fn with_insert_retry_delay(mut self, delay: Duration) -> Self {
        self.insert_retry_delay = delay;
        self
    }

    /// Builder method to set match attempts.
    pub fn with_match_attempts(mut self, attempts: u32) -> Self {
        self.match_attempts = attempts;
        self
    }

    /// Builder method to set the candidate limit.
    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit;
        self
    }

    /// Builder method to set the job batch size.
    pub fn with_job_batch_size(mut self, size: usize) -> Self {
        self.job_batch_size = size;
        self
    }

    /// Builder method to set private pilot types.
    pub fn with_private_pilot_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.private_pilot_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the RNG seed.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Builder method to set the minimum queue share.
    pub fn with_min_queue_share(mut self, share: f64) -> Self {
        self.min_queue_share = share;
        self
    }

    /// Builder method to set the share sweep interval.
    pub fn with_share_sweep_interval(mut self, interval: Duration) -> Self {
        self.share_sweep_interval = interval;
        self
    }
}

/// One history window of the usage correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryWindow {
    /// Length of the trailing window, in seconds.
    pub time_span_secs: u64,
    /// Relative weight; weights are normalized to sum to 1.
    pub weight: f64,
    /// Bound on this window's correction factor.
    pub max_correction: f64,
}

impl HistoryWindow {
    /// Creates a window.
    pub fn new(time_span: Duration, weight: f64, max_correction: f64) -> Self {
        Self {
            time_span_secs: time_span.as_secs(),
            weight,
            max_correction,
        }
    }

    /// Length of the trailing window.
    pub fn time_span(&self) -> Duration {
        Duration::from_secs(self.time_span_secs)
    }
}

/// Configuration of the historical usage correction.
///
/// ```yaml
/// enabled: true
/// update_period_secs: 600
/// global_max_correction: 3.0
/// windows:
///   - { time_span_secs: 86400, weight: 0.7, max_correction: 3.0 }
///   - { time_span_secs: 604800, weight: 0.3, max_correction: 2.0 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_update_period_secs")]
    pub update_period_secs: u64,
    #[serde(default = "default_global_max_correction")]
    pub global_max_correction: f64,
    #[serde(default)]
    pub windows: Vec<HistoryWindow>,
}

fn default_enabled() -> bool {
    true
}

fn default_update_period_secs() -> u64 {
    600
}

fn default_global_max_correction() -> f64 {
    3.0
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            update_period_secs: default_update_period_secs(),
            global_max_correction: default_global_max_correction(),
            windows: vec![HistoryWindow::new(Duration::from_secs(86_400), 1.0, 3.0)],
        }
    }
}

impl HistoryConfig {
    /// A configuration that never corrects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Builder method to set the windows.
    pub fn with_windows(mut self, windows: Vec<HistoryWindow>) -> Self {
        self.windows = windows;
        self
    }

    /// Builder method to set the update period.
    pub fn with_update_period(mut self, period: Duration) -> Self {
        self.update_period_secs = period.as_secs();
        self
    }

    /// Builder method to set the global correction bound.
    pub fn with_global_max_correction(mut self, bound: f64) -> Self {
        self.global_max_correction = bound;
        self
    }

    /// Minimum time between two refreshes.
    pub fn update_period(&self) -> Duration {
        Duration::from_secs(self.update_period_secs)
    }

    /// Windows with weights normalized to sum to 1.
    pub fn normalized_windows(&self) -> Vec<HistoryWindow> {
        let total: f64 = self.windows.iter().map(|w| w.weight).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        self.windows
            .iter()
            .map(|w| HistoryWindow {
                weight: w.weight / total,
                ..w.clone()
            })
            .collect()
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.global_max_correction.is_finite() && self.global_max_correction >= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "global_max_correction must be at least 1.0".to_string(),
            ));
        }

        for window in &self.windows {
            if window.time_span_secs == 0 {
                return Err(ConfigError::ValidationFailed(
                    "history window time span must be greater than 0".to_string(),
                ));
            }
            if !(window.weight.is_finite() && window.weight > 0.0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "weight of the {}s window must be greater than 0",
                    window.time_span_secs
                )));
            }
            if !(window.max_correction.is_finite() && window.max_correction >= 1.0) {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_correction of the {}s window must be at least 1.0",
                    window.time_span_secs
                )));
            }
        }

        Ok(())
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a comma-separated environment variable value.
fn parse_env_list<T: std::str::FromStr>(value: &str, key: &str) -> Result<Vec<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(|item| parse_env_value(item, key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.insert_max_retries, 10);
        assert_eq!(config.insert_retry_delay, Duration::from_millis(100));
        assert_eq!(config.match_attempts, 3);
        assert_eq!(config.candidate_limit, 10);
        assert_eq!(config.job_batch_size, 10);
        assert!(config.private_pilot_types.contains("private"));
        assert_eq!(config.segments().unwrap().boundaries(), &[500, 5_000, 50_000, 300_000]);
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .with_cpu_segments(vec![100, 1_000])
            .with_priority_bounds(1.0, 5.0)
            .with_insert_retries(3)
            .with_insert_retry_delay(Duration::from_millis(5))
            .with_match_attempts(2)
            .with_candidate_limit(4)
            .with_job_batch_size(2)
            .with_private_pilot_types(["private", "sgm"])
            .with_rng_seed(7)
            .with_min_queue_share(0.01);

        assert!(config.validate().is_ok());
        assert_eq!(config.priority_bounds().max, 5.0);
        assert_eq!(config.private_pilot_types.len(), 2);
        assert_eq!(config.rng_seed, Some(7));
    }

    #[test]
    fn test_validation_failures() {
        assert!(SchedulerConfig::new().with_cpu_segments(vec![]).validate().is_err());
        assert!(SchedulerConfig::new()
            .with_priority_bounds(5.0, 1.0)
            .validate()
            .is_err());
        assert!(SchedulerConfig::new().with_insert_retries(0).validate().is_err());
        assert!(SchedulerConfig::new().with_candidate_limit(0).validate().is_err());
        assert!(SchedulerConfig::new().with_min_queue_share(0.0).validate().is_err());
    }

    #[test]
    fn test_parse_env_helpers() {
        let value: u32 = parse_env_value(" 42 ", "KEY").unwrap();
        assert_eq!(value, 42);
        let err = parse_env_value::<u32>("lots", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));

        let list: Vec<u64> = parse_env_list("500, 5000,", "KEY").unwrap();
        assert_eq!(list, vec![500, 5_000]);
    }

    #[test]
    fn test_history_config_yaml() {
        let config = HistoryConfig::from_yaml_str(
            r#"
update_period_secs: 60
windows:
  - { time_span_secs: 3600, weight: 3.0, max_correction: 2.0 }
  - { time_span_secs: 86400, weight: 1.0, max_correction: 4.0 }
"#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.update_period(), Duration::from_secs(60));
        assert_eq!(config.global_max_correction, 3.0);

        let windows = config.normalized_windows();
        assert!((windows[0].weight - 0.75).abs() < 1e-12);
        assert!((windows[1].weight - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_history_config_rejects_bad_windows() {
        assert!(HistoryConfig::from_yaml_str(
            "windows:\n  - { time_span_secs: 60, weight: 1.0, max_correction: 0.5 }\n"
        )
        .is_err());
        assert!(HistoryConfig::from_yaml_str("global_max_correction: 0.2\n").is_err());
    }
}

//! File-backed usage reporter.
//!
//! Reads average running counts exported by an accounting job. The file is
//! re-read on every request, so a periodic export is picked up by the next
//! history refresh without restarting the scheduler.
//!
//! ```yaml
//! windows:
//!   86400:
//!     groups:
//!       biomed_user: 12.5
//!       lhcb_prod: 40.0
//!     identities:
//!       biomed_user:
//!         /DC=org/CN=alice: 8.0
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CollaboratorError;

use super::{UsageGrouping, UsageReporter};

/// Usage of one window span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowUsage {
    /// Average running jobs per owner group.
    #[serde(default)]
    pub groups: HashMap<String, f64>,
    /// Average running jobs per owner identity, by group.
    #[serde(default)]
    pub identities: HashMap<String, HashMap<String, f64>>,
}

/// On-disk layout of a usage export, keyed by window span in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageFile {
    #[serde(default)]
    pub windows: BTreeMap<u64, WindowUsage>,
}

impl UsageFile {
    fn validate(&self) -> Result<(), CollaboratorError> {
        for (span, window) in &self.windows {
            let samples = window
                .groups
                .iter()
                .chain(window.identities.values().flatten());
            for (entity, usage) in samples {
                if !usage.is_finite() || *usage < 0.0 {
                    return Err(CollaboratorError::ReportFailed {
                        span: Duration::from_secs(*span),
                        reason: format!("usage of '{}' must be a non-negative number", entity),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Usage reporter reading a YAML export.
#[derive(Debug, Clone)]
pub struct FileUsageReporter {
    path: PathBuf,
}

impl FileUsageReporter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<UsageFile, CollaboratorError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let file: UsageFile = serde_yaml::from_str(&text)?;
        file.validate()?;
        Ok(file)
    }
}

#[async_trait]
impl UsageReporter for FileUsageReporter {
    /// A span missing from the export fails, which makes the history
    /// refresh keep no data rather than a partial picture. A group missing
    /// under `identities` means nobody in it ran anything.
    async fn average_running_count(
        &self,
        span: Duration,
        grouping: &UsageGrouping,
    ) -> Result<HashMap<String, f64>, CollaboratorError> {
        let mut file = self.load().await?;
        let Some(mut window) = file.windows.remove(&span.as_secs()) else {
            return Err(CollaboratorError::ReportFailed {
                span,
                reason: format!("{} has no samples for this window", self.path.display()),
            });
        };

        let samples = match grouping {
            UsageGrouping::ByGroup => window.groups,
            UsageGrouping::ByIdentityInGroup(group) => {
                window.identities.remove(group).unwrap_or_default()
            }
        };
        debug!(
            path = %self.path.display(),
            grouping = %grouping,
            entities = samples.len(),
            "Loaded usage samples"
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DAY: Duration = Duration::from_secs(86_400);

    const EXPORT: &str = r#"
windows:
  86400:
    groups:
      biomed_user: 12.5
      lhcb_prod: 40.0
    identities:
      biomed_user:
        /DC=org/CN=alice: 8.0
"#;

    fn export(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", text).unwrap();
        file
    }

    #[tokio::test]
    async fn test_serves_groups_and_identities() {
        let file = export(EXPORT);
        let reporter = FileUsageReporter::new(file.path());

        let groups = reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["lhcb_prod"], 40.0);

        let alice = reporter
            .average_running_count(DAY, &UsageGrouping::ByIdentityInGroup("biomed_user".into()))
            .await
            .unwrap();
        assert_eq!(alice["/DC=org/CN=alice"], 8.0);

        let idle = reporter
            .average_running_count(DAY, &UsageGrouping::ByIdentityInGroup("lhcb_prod".into()))
            .await
            .unwrap();
        assert!(idle.is_empty());
    }

    #[tokio::test]
    async fn test_missing_window_fails() {
        let file = export(EXPORT);
        let reporter = FileUsageReporter::new(file.path());
        let err = reporter
            .average_running_count(Duration::from_secs(3_600), &UsageGrouping::ByGroup)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ReportFailed { .. }));
    }

    #[tokio::test]
    async fn test_rewritten_export_is_picked_up() {
        let file = export(EXPORT);
        let reporter = FileUsageReporter::new(file.path());

        std::fs::write(file.path(), "windows:\n  86400:\n    groups:\n      biomed_user: 1.0\n")
            .unwrap();
        let groups = reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["biomed_user"], 1.0);
    }

    #[tokio::test]
    async fn test_negative_usage_rejected() {
        let file = export("windows:\n  86400:\n    groups:\n      g: -1.0\n");
        let reporter = FileUsageReporter::new(file.path());
        assert!(reporter
            .average_running_count(DAY, &UsageGrouping::ByGroup)
            .await
            .is_err());
    }
}

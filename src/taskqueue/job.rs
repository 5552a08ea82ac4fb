//! Pending jobs and priority remapping.
//!
//! Jobs carry the caller's integer priority plus an effective priority used
//! as a weight during extraction. The effective priority is the submitted
//! value clamped into `[min, max]`; values landing exactly on a bound are
//! replaced by extreme weights so weighted selection never degenerates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::TaskQueueId;

/// Weight given to jobs clamped onto the lower priority bound.
pub const LOWEST_EFFECTIVE_PRIORITY: f64 = 1e-5;

/// Weight given to jobs clamped onto the upper priority bound.
pub const HIGHEST_EFFECTIVE_PRIORITY: f64 = 1e6;

/// Range submitted priorities are clamped into.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityBounds {
    pub min: f64,
    pub max: f64,
}

impl Default for PriorityBounds {
    fn default() -> Self {
        Self {
            min: 0.001,
            max: 10.0,
        }
    }
}

impl PriorityBounds {
    /// Computes the effective priority for a submitted priority.
    pub fn effective(&self, submitted: i64) -> f64 {
        let clamped = (submitted as f64).clamp(self.min, self.max);
        if clamped <= self.min {
            LOWEST_EFFECTIVE_PRIORITY
        } else if clamped >= self.max {
            HIGHEST_EFFECTIVE_PRIORITY
        } else {
            clamped
        }
    }

    /// Returns true if `min < max` and both are positive and finite.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min > 0.0 && self.min < self.max
    }
}

/// A job waiting in exactly one task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier supplied by the producer.
    pub job_id: String,
    /// Task queue owning the job.
    pub task_queue_id: TaskQueueId,
    /// Priority as submitted by the producer.
    pub submitted_priority: i64,
    /// Clamped priority used as selection weight.
    pub effective_priority: f64,
    /// When the job entered its task queue.
    pub inserted_at: DateTime<Utc>,
}

/// A job extracted by a successful match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedJob {
    pub job_id: String,
    pub task_queue_id: TaskQueueId,
    pub owner_identity: String,
    pub owner_group: String,
}

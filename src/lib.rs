//! gridmatch: task-queue matchmaking for grid jobs.
//!
//! Pending jobs are grouped into task queues keyed by their exact resource
//! requirements. Resources describe their capabilities and receive one job
//! at a time, drawn from the queues they can run with probabilities driven
//! by fair-share priorities corrected by recent usage.

pub mod cli;
pub mod collaborators;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod storage;
pub mod taskqueue;

// Re-export commonly used error types
pub use error::{CollaboratorError, SchedulerError, ValidationError};
pub use storage::StoreError;

//! Task-queue data model.
//!
//! - **TaskQueueDefinition**: the equivalence-class key grouping jobs with
//!   identical requirements
//! - **JobRequirements**: the producer-side document a definition is built from
//! - **Capabilities**: the resource-side document matched against definitions
//! - **Job**: a pending job and its effective priority

pub mod capabilities;
pub mod definition;
pub mod job;
pub mod requirements;

pub use capabilities::{Capabilities, MatchFilter, OwnerRestriction};
pub use definition::{
    CpuSegments, MultiValueField, TaskQueueDefinition, TaskQueueId, DEFAULT_CPU_SEGMENTS,
};
pub use job::{Job, MatchedJob, PriorityBounds, HIGHEST_EFFECTIVE_PRIORITY, LOWEST_EFFECTIVE_PRIORITY};
pub use requirements::JobRequirements;

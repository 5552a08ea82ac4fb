//! Matchmaking, fair shares and the scheduler facade.
//!
//! - **SchedulerFacade**: insert, match, delete and reprioritize jobs
//! - **Matcher**: extracts one job for a resource description
//! - **ShareCalculator**: turns configured group shares into task-queue priorities
//! - **SharesCorrector**: biases shares by recent usage
//! - **ShareSweeper**: periodic refresh of shares and usage history
//!
//! # Architecture
//!
//! ```text
//!    producer ──insert──┐           ┌──match── resource
//!                       ▼           ▼
//!                 ┌──────────────────────┐
//!                 │   SchedulerFacade    │
//!                 └───┬──────────────┬───┘
//!                     │              │
//!              ┌──────▼─────┐  ┌─────▼─────┐
//!              │ShareCalc.  │◄─┤  Matcher  │
//!              └──┬──────┬──┘  └─────┬─────┘
//!                 │      │           │
//!   SharesCorrector      ▼           ▼
//!                 ┌──────────────────────┐
//!                 │    TaskQueueStore    │
//!                 └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridmatch::collaborators::StaticShareConfig;
//! use gridmatch::scheduler::{SchedulerConfig, SchedulerFacade};
//! use gridmatch::storage::MemoryTaskQueueStore;
//! use gridmatch::taskqueue::{Capabilities, JobRequirements};
//! use std::sync::Arc;
//!
//! let scheduler = SchedulerFacade::new(
//!     SchedulerConfig::from_env()?,
//!     Arc::new(MemoryTaskQueueStore::new()),
//!     Arc::new(StaticShareConfig::new(1.0)),
//!     None,
//! )?;
//!
//! let reqs = JobRequirements::new("/CN=alice", "biomed_user", "Production", 1000);
//! scheduler.insert_job("job-1", &reqs, 5).await?;
//!
//! let outcome = scheduler
//!     .match_job(&Capabilities::new().with_setup("Production"))
//!     .await?;
//! ```

pub mod config;
pub mod facade;
pub mod history;
pub mod matcher;
pub mod sampling;
pub mod shares;
pub mod sweeper;

pub use config::{ConfigError, HistoryConfig, HistoryWindow, SchedulerConfig};
pub use facade::{DeleteReport, PriorityReport, SchedulerFacade};
pub use history::{HistoryCorrector, SharesCorrector};
pub use matcher::{MatchOutcome, Matcher, MatcherSettings};
pub use shares::{distribute_share, GroupShare, GroupShareCache, ShareCalculator};
pub use sweeper::{sweep_once, ShareSweeper, SweeperError};

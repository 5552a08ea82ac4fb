//! Command-line interface for gridmatch.
//!
//! Provides commands for schema migration, job insertion and matching,
//! bulk maintenance and task-queue inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};

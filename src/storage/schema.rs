//! Database schema constants.
//!
//! Task queues, their multi-value attributes and their jobs live in three
//! tables. Multi-value rows and jobs reference their task queue, so removing
//! a task queue row removes everything attached to it.

/// SQL schema for creating the task queues table.
///
/// `fingerprint` is the SHA-256 of the canonical definition; the unique
/// constraint keeps at most one task queue per equivalence class.
pub const CREATE_TASK_QUEUES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tq_task_queues (
    tq_id BIGSERIAL PRIMARY KEY,
    fingerprint CHAR(64) NOT NULL UNIQUE,
    owner_identity VARCHAR(255) NOT NULL,
    owner_group VARCHAR(128) NOT NULL,
    setup VARCHAR(128) NOT NULL,
    cpu_time BIGINT NOT NULL,
    priority DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    enabled BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the multi-value attribute table.
///
/// A field with no rows is a wildcard. A present-but-empty set is kept as a
/// single row with a NULL value so it stays distinguishable.
pub const CREATE_MULTI_VALUES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tq_multi_values (
    id BIGSERIAL PRIMARY KEY,
    tq_id BIGINT NOT NULL REFERENCES tq_task_queues(tq_id) ON DELETE CASCADE,
    field VARCHAR(32) NOT NULL,
    value VARCHAR(255),
    UNIQUE(tq_id, field, value)
)
"#;

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tq_jobs (
    job_id VARCHAR(255) PRIMARY KEY,
    tq_id BIGINT NOT NULL REFERENCES tq_task_queues(tq_id) ON DELETE CASCADE,
    submitted_priority BIGINT NOT NULL,
    effective_priority DOUBLE PRECISION NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Index on jobs by task queue and priority, used by extraction.
pub const CREATE_JOBS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tq_jobs_tq_priority ON tq_jobs(tq_id, effective_priority, job_id)";

/// Index on multi-value rows by field and value, used by matching.
pub const CREATE_MULTI_VALUES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tq_multi_values_field ON tq_multi_values(field, value)";

/// Index on task queues by owner group, used by share recalculation.
pub const CREATE_TASK_QUEUES_GROUP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_tq_task_queues_group ON tq_task_queues(owner_group, owner_identity)";

/// One versioned step of the schema.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Strictly increasing across [`MIGRATIONS`].
    pub version: i32,
    pub name: &'static str,
    /// Applied in order, inside one transaction.
    pub statements: &'static [&'static str],
}

/// Every migration this build knows, oldest first.
///
/// Each table comes with the index its hot queries need. Queue rows come
/// first since the other two tables reference them.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "task_queues",
        statements: &[CREATE_TASK_QUEUES_TABLE, CREATE_TASK_QUEUES_GROUP_INDEX],
    },
    Migration {
        version: 2,
        name: "multi_values",
        statements: &[CREATE_MULTI_VALUES_TABLE, CREATE_MULTI_VALUES_INDEX],
    },
    Migration {
        version: 3,
        name: "jobs",
        statements: &[CREATE_JOBS_TABLE, CREATE_JOBS_INDEX],
    },
];

/// Table names in the schema.
pub mod tables {
    /// Task queues table name.
    pub const TASK_QUEUES: &str = "tq_task_queues";
    /// Multi-value attributes table name.
    pub const MULTI_VALUES: &str = "tq_multi_values";
    /// Jobs table name.
    pub const JOBS: &str = "tq_jobs";
    /// Migration bookkeeping.
    pub const MIGRATIONS: &str = "_migrations";

    /// Drop order: referencing tables before the queue table.
    pub const DROP_ORDER: [&str; 4] = [JOBS, MULTI_VALUES, TASK_QUEUES, MIGRATIONS];
}

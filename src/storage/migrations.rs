//! Versioned schema migrations.
//!
//! Every entry of [`schema::MIGRATIONS`] runs in its own transaction together
//! with its `_migrations` row, so a version is either fully applied or not at
//! all. A Postgres advisory lock serialises runners: several scheduler
//! processes may start against the same database at once.

use std::collections::BTreeSet;

use sqlx::{Connection, PgConnection, PgPool};
use thiserror::Error;
use tracing::info;

use super::schema::{self, tables, Migration};

/// Advisory lock key held while migrating ("gridmatc" in ASCII).
const MIGRATION_LOCK_KEY: i64 = 0x6772_6964_6d61_7463;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A migration statement failed; its transaction was rolled back.
    #[error("Migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        version: i32,
        name: &'static str,
        source: sqlx::Error,
    },

    /// The database carries a version this build does not know.
    #[error("Database schema version {0} is newer than this build")]
    UnknownVersion(i32),
}

/// Migration runner for the task-queue schema.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies every pending migration. Returns how many were applied.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = apply_pending(&mut conn).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await?;
        result
    }

    /// Migrations not yet applied to the database.
    pub async fn pending_migrations(&self) -> Result<Vec<&'static Migration>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        ensure_migrations_table(&mut conn).await?;
        let applied = applied_versions(&mut conn).await?;
        pending(schema::MIGRATIONS, &applied)
    }

    /// Returns the applied migrations, oldest first.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        let mut conn = self.pool.acquire().await?;
        ensure_migrations_table(&mut conn).await?;

        let migrations: Vec<AppliedMigration> =
            sqlx::query_as("SELECT version, name, applied_at FROM _migrations ORDER BY version")
                .fetch_all(&mut *conn)
                .await?;

        Ok(migrations)
    }

    /// Drops every task-queue table and the migration history.
    ///
    /// **WARNING**: This will destroy all pending jobs. Use only in
    /// development/testing.
    pub async fn reset_database(&self) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;
        for table in tables::DROP_ORDER {
            sqlx::query(&format!("DROP TABLE IF EXISTS {} CASCADE", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn apply_pending(conn: &mut PgConnection) -> Result<usize, MigrationError> {
    ensure_migrations_table(conn).await?;
    let applied = applied_versions(conn).await?;
    let remaining = pending(schema::MIGRATIONS, &applied)?;

    for migration in &remaining {
        let mut tx = conn.begin().await?;
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| MigrationError::MigrationFailed {
                    version: migration.version,
                    name: migration.name,
                    source,
                })?;
        }
        sqlx::query("INSERT INTO _migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(remaining.len())
}

async fn ensure_migrations_table(conn: &mut PgConnection) -> Result<(), MigrationError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name VARCHAR(64) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn applied_versions(conn: &mut PgConnection) -> Result<BTreeSet<i32>, MigrationError> {
    let rows: Vec<(i32,)> = sqlx::query_as("SELECT version FROM _migrations")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(version,)| version).collect())
}

/// Migrations of `known` missing from `applied`, in order.
///
/// Refuses to run against a database that went past this build.
fn pending<'a>(
    known: &'a [Migration],
    applied: &BTreeSet<i32>,
) -> Result<Vec<&'a Migration>, MigrationError> {
    if let Some(unknown) = applied
        .iter()
        .find(|version| !known.iter().any(|m| m.version == **version))
    {
        return Err(MigrationError::UnknownVersion(*unknown));
    }
    Ok(known
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect())
}

/// Record of an applied migration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppliedMigration {
    pub version: i32,
    pub name: String,
    pub applied_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_needs_everything() {
        let remaining = pending(schema::MIGRATIONS, &BTreeSet::new()).unwrap();
        assert_eq!(remaining.len(), schema::MIGRATIONS.len());
        assert_eq!(remaining[0].name, "task_queues");
    }

    #[test]
    fn test_applied_versions_are_skipped() {
        let applied = BTreeSet::from([1, 2]);
        let remaining = pending(schema::MIGRATIONS, &applied).unwrap();
        let versions: Vec<i32> = remaining.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![3]);

        let all: BTreeSet<i32> = schema::MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(pending(schema::MIGRATIONS, &all).unwrap().is_empty());
    }

    #[test]
    fn test_newer_database_is_refused() {
        let applied = BTreeSet::from([1, 2, 3, 42]);
        let err = pending(schema::MIGRATIONS, &applied).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownVersion(42)));
        assert!(err.to_string().contains("42"));
    }
}

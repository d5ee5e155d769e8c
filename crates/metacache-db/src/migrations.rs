//! # Database Migrations
//!
//! Embedded SQL migrations for the relational tier.
//!
//! ```text
//! migrations/sqlite/
//! ├── 001_initial_schema.sql  # environments, versions, records, labels, sessions
//! └── 002_search_index.sql    # FTS5 table + delete trigger
//! ```
//!
//! Never modify an applied migration; add a new one. A migration that changes
//! indexed columns must be followed by [`crate::SearchIndex::rebuild`].

use sqlx::SqlitePool;
use tracing::info;

use crate::error::DbResult;

/// Embedded migrations from the workspace `migrations/sqlite` directory.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations/sqlite");

/// Runs all pending database migrations.
///
/// Idempotent; each migration runs in its own transaction, in filename order.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    info!("Checking for pending migrations");

    MIGRATOR.run(pool).await?;

    info!("All migrations applied successfully");
    Ok(())
}

/// Returns (total_migrations, applied_migrations).
pub async fn migration_status(pool: &SqlitePool) -> DbResult<(usize, usize)> {
    let total = MIGRATOR.migrations.len();

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .unwrap_or(0);

    Ok((total, applied as usize))
}

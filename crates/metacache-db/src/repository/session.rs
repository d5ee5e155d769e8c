//! # Sync Session Repository
//!
//! Persists sync sessions so progress and history survive restarts.
//!
//! ```text
//! start ──► save(pending/running) ──► save(after each page) ──► save(terminal)
//!                                                                   │
//!                                                   prune(history_limit)
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use metacache_core::{
    EnvironmentId, SessionId, SyncMode, SyncProgress, SyncScope, SyncSession, SyncState,
};

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    environment_id: i64,
    mode: SyncMode,
    scope: String,
    state: SyncState,
    version_id: Option<i64>,
    progress: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl TryFrom<SessionRow> for SyncSession {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let id: SessionId = row
            .id
            .parse()
            .map_err(|e| DbError::corrupt("sync_sessions", e))?;
        let scope: SyncScope = row
            .scope
            .parse()
            .map_err(|e| DbError::corrupt("sync_sessions", e))?;
        let progress: SyncProgress = serde_json::from_str(&row.progress)?;

        Ok(SyncSession {
            id,
            environment_id: row.environment_id,
            mode: row.mode,
            scope,
            state: row.state,
            version_id: row.version_id,
            progress,
            started_at: row.started_at,
            ended_at: row.ended_at,
            error: row.error,
        })
    }
}

const SESSION_COLUMNS: &str =
    "id, environment_id, mode, scope, state, version_id, progress, started_at, ended_at, error";

/// Repository for sync sessions.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SessionRepository { pool }
    }

    /// Inserts the session or overwrites its mutable columns.
    pub async fn save(&self, session: &SyncSession) -> DbResult<()> {
        let progress = serde_json::to_string(&session.progress)?;

        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, environment_id, mode, scope, state, version_id,
                progress, started_at, ended_at, error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                version_id = excluded.version_id,
                progress = excluded.progress,
                ended_at = excluded.ended_at,
                error = excluded.error
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.environment_id)
        .bind(session.mode)
        .bind(session.scope.to_string())
        .bind(session.state)
        .bind(session.version_id)
        .bind(progress)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(&session.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> DbResult<Option<SyncSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncSession::try_from).transpose()
    }

    /// Sessions of an environment, newest first.
    pub async fn history(
        &self,
        environment_id: EnvironmentId,
        limit: usize,
    ) -> DbResult<Vec<SyncSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions \
             WHERE environment_id = ?1 \
             ORDER BY started_at DESC, rowid DESC \
             LIMIT ?2"
        ))
        .bind(environment_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncSession::try_from).collect()
    }

    pub async fn count(&self, environment_id: EnvironmentId) -> DbResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_sessions WHERE environment_id = ?1")
            .bind(environment_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(n as u64)
    }

    /// Deletes finished sessions beyond the newest `keep`.
    pub async fn prune(&self, environment_id: EnvironmentId, keep: usize) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_sessions
            WHERE environment_id = ?1
              AND state NOT IN ('pending', 'running')
              AND id NOT IN (
                  SELECT id FROM sync_sessions
                  WHERE environment_id = ?1
                  ORDER BY started_at DESC, rowid DESC
                  LIMIT ?2
              )
            "#,
        )
        .bind(environment_id)
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            debug!(environment_id, pruned = result.rows_affected(), "Pruned sync history");
        }
        Ok(result.rows_affected())
    }

    /// Fails sessions left `pending` or `running` by a previous process.
    ///
    /// Their tasks died with that process; nothing will ever finish them.
    pub async fn fail_abandoned(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_sessions SET
                state = 'failed',
                ended_at = ?1,
                error = 'interrupted by shutdown'
            WHERE state IN ('pending', 'running')
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            warn!(count = result.rows_affected(), "Marked abandoned sync sessions as failed");
        }
        Ok(result.rows_affected())
    }
}

//! # Environment Repository
//!
//! One row per remote environment, keyed by base URL. Holds the pointer to
//! the current metadata version and the incremental-sync marker.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use metacache_core::{Environment, EnvironmentId, VersionId};

/// Repository for environment rows.
#[derive(Debug, Clone)]
pub struct EnvironmentRepository {
    pool: SqlitePool,
}

impl EnvironmentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        EnvironmentRepository { pool }
    }

    /// Returns the environment for `base_url`, creating it on first use.
    ///
    /// Base URLs are compared after trimming a trailing `/`.
    pub async fn get_or_create(&self, base_url: &str) -> DbResult<Environment> {
        let base_url = base_url.trim_end_matches('/');

        let inserted = sqlx::query(
            r#"
            INSERT INTO environments (base_url, created_at)
            VALUES (?1, ?2)
            ON CONFLICT (base_url) DO NOTHING
            "#,
        )
        .bind(base_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(base_url = %base_url, "Registered environment");
        }

        self.find_by_url(base_url)
            .await?
            .ok_or_else(|| DbError::not_found("Environment", base_url))
    }

    pub async fn get(&self, id: EnvironmentId) -> DbResult<Option<Environment>> {
        let env = sqlx::query_as::<_, Environment>(
            r#"
            SELECT id, base_url, current_version_id, created_at, last_sync_at
            FROM environments
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(env)
    }

    pub async fn find_by_url(&self, base_url: &str) -> DbResult<Option<Environment>> {
        let env = sqlx::query_as::<_, Environment>(
            r#"
            SELECT id, base_url, current_version_id, created_at, last_sync_at
            FROM environments
            WHERE base_url = ?1
            "#,
        )
        .bind(base_url.trim_end_matches('/'))
        .fetch_optional(&self.pool)
        .await?;

        Ok(env)
    }

    pub async fn list(&self) -> DbResult<Vec<Environment>> {
        let envs = sqlx::query_as::<_, Environment>(
            r#"
            SELECT id, base_url, current_version_id, created_at, last_sync_at
            FROM environments
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(envs)
    }

    /// Points the environment at a new current version.
    ///
    /// Clears the incremental-sync marker: a new generation starts unsynced.
    pub async fn set_current_version(
        &self,
        id: EnvironmentId,
        version_id: VersionId,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE environments SET
                current_version_id = ?2,
                last_sync_at = CASE WHEN current_version_id IS ?2 THEN last_sync_at ELSE NULL END
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(version_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Environment", id));
        }

        debug!(environment_id = id, version_id, "Current version updated");
        Ok(())
    }

    /// Records a completed sync. `at` is when that sync started, so records
    /// modified while it ran are picked up by the next incremental pass.
    pub async fn mark_synced(&self, id: EnvironmentId, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE environments SET last_sync_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::*;

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let db = setup().await;
        let repo = db.environments();

        let a = repo.get_or_create("https://erp.example.com/").await.unwrap();
        let b = repo.get_or_create("https://erp.example.com").await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(a.base_url, "https://erp.example.com");
        assert!(!a.has_synced());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_version_change_clears_sync_marker() {
        let db = setup().await;
        let (env, v1) = env_with_version(&db, "10.0.38").await;
        let repo = db.environments();

        repo.mark_synced(env.id, Utc::now()).await.unwrap();
        repo.set_current_version(env.id, v1.id).await.unwrap();
        assert!(repo.get(env.id).await.unwrap().unwrap().has_synced());

        let v2 = db.versions().upsert(env.id, &version("10.0.39")).await.unwrap();
        repo.set_current_version(env.id, v2.id).await.unwrap();

        let env = repo.get(env.id).await.unwrap().unwrap();
        assert_eq!(env.current_version_id, Some(v2.id));
        assert!(!env.has_synced());
    }

    #[tokio::test]
    async fn test_set_current_version_unknown_environment() {
        let db = setup().await;
        let err = db.environments().set_current_version(42, 1).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }
}

//! # Version Repository
//!
//! Metadata generations per environment. Several versions coexist; the
//! environment row says which one is current.
//!
//! ## Retention
//! ```text
//! versions (newest first):  v5  v4  v3  v2  v1
//! keep = 2                  ──────  ─────────── deleted (cascades to
//!                                               records, labels, FTS rows)
//! The current version is never pruned, even when it is not the newest.
//! ```

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use metacache_core::{EnvironmentId, MetadataVersion, StoredVersion, VersionId};

#[derive(Debug, FromRow)]
struct VersionRow {
    id: i64,
    environment_id: i64,
    application_version: String,
    platform_version: String,
    application_build: String,
    platform_build: String,
    first_seen_at: DateTime<Utc>,
}

impl From<VersionRow> for StoredVersion {
    fn from(row: VersionRow) -> Self {
        StoredVersion {
            id: row.id,
            environment_id: row.environment_id,
            version: MetadataVersion {
                application_version: row.application_version,
                platform_version: row.platform_version,
                application_build: row.application_build,
                platform_build: row.platform_build,
            },
            first_seen_at: row.first_seen_at,
        }
    }
}

const VERSION_COLUMNS: &str = "id, environment_id, application_version, platform_version, \
     application_build, platform_build, first_seen_at";

/// Repository for metadata versions.
#[derive(Debug, Clone)]
pub struct VersionRepository {
    pool: SqlitePool,
}

impl VersionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        VersionRepository { pool }
    }

    /// Returns the stored row for `version`, inserting it when first seen.
    pub async fn upsert(
        &self,
        environment_id: EnvironmentId,
        version: &MetadataVersion,
    ) -> DbResult<StoredVersion> {
        let fingerprint = version.fingerprint();

        let inserted = sqlx::query(
            r#"
            INSERT INTO metadata_versions (
                environment_id, fingerprint, application_version, platform_version,
                application_build, platform_build, first_seen_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (environment_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(environment_id)
        .bind(&fingerprint)
        .bind(&version.application_version)
        .bind(&version.platform_version)
        .bind(&version.application_build)
        .bind(&version.platform_build)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(environment_id, version = %version, "New metadata version recorded");
        }

        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM metadata_versions \
             WHERE environment_id = ?1 AND fingerprint = ?2"
        ))
        .bind(environment_id)
        .bind(&fingerprint)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("MetadataVersion", &fingerprint))?;

        Ok(row.into())
    }

    pub async fn get(&self, id: VersionId) -> DbResult<Option<StoredVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM metadata_versions WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Lists an environment's versions, newest first.
    pub async fn list(&self, environment_id: EnvironmentId) -> DbResult<Vec<StoredVersion>> {
        let rows = sqlx::query_as::<_, VersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM metadata_versions \
             WHERE environment_id = ?1 ORDER BY id DESC"
        ))
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Deletes all but the newest `keep` versions, never touching `current`.
    ///
    /// Returns the ids of deleted versions. Their records, labels and index
    /// entries go with them.
    pub async fn prune(
        &self,
        environment_id: EnvironmentId,
        keep: usize,
        current: Option<VersionId>,
    ) -> DbResult<Vec<VersionId>> {
        let keep = keep.max(1) as i64;
        let mut tx = self.pool.begin().await?;

        let doomed: Vec<VersionId> = sqlx::query_scalar(
            r#"
            SELECT id FROM metadata_versions
            WHERE environment_id = ?1
              AND id IS NOT ?2
              AND id NOT IN (
                  SELECT id FROM metadata_versions
                  WHERE environment_id = ?1
                  ORDER BY id DESC
                  LIMIT ?3
              )
            "#,
        )
        .bind(environment_id)
        .bind(current)
        .bind(keep)
        .fetch_all(&mut *tx)
        .await?;

        for id in &doomed {
            sqlx::query("DELETE FROM metadata_versions WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if !doomed.is_empty() {
            debug!(environment_id, pruned = ?doomed, "Pruned metadata versions");
        }
        Ok(doomed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::*;

    #[tokio::test]
    async fn test_upsert_returns_same_row() {
        let db = setup().await;
        let env = db.environments().get_or_create("https://a").await.unwrap();
        let repo = db.versions();

        let first = repo.upsert(env.id, &version("10.0.38")).await.unwrap();
        let again = repo.upsert(env.id, &version("10.0.38")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.version, version("10.0.38"));
        assert_eq!(repo.get(first.id).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_current() {
        let db = setup().await;
        let env = db.environments().get_or_create("https://a").await.unwrap();
        let repo = db.versions();

        let v1 = repo.upsert(env.id, &version("1")).await.unwrap();
        let v2 = repo.upsert(env.id, &version("2")).await.unwrap();
        let v3 = repo.upsert(env.id, &version("3")).await.unwrap();
        let v4 = repo.upsert(env.id, &version("4")).await.unwrap();

        // v1 is current (e.g. upstream rolled back); it survives.
        let pruned = repo.prune(env.id, 2, Some(v1.id)).await.unwrap();
        assert_eq!(pruned, vec![v2.id]);

        let remaining: Vec<_> = repo.list(env.id).await.unwrap().iter().map(|v| v.id).collect();
        assert_eq!(remaining, vec![v4.id, v3.id, v1.id]);
    }
}

//! # Label Repository
//!
//! Resolved label text keyed by (environment, version, label id, language).
//! A label, once resolved for a version, never changes: writes that hit an
//! existing key are ignored.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use metacache_core::{EnvironmentId, LabelKey, LabelRecord, VersionId};

/// Repository for resolved labels.
#[derive(Debug, Clone)]
pub struct LabelRepository {
    pool: SqlitePool,
}

impl LabelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        LabelRepository { pool }
    }

    pub async fn get(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        key: &LabelKey,
    ) -> DbResult<Option<LabelRecord>> {
        let text: Option<String> = sqlx::query_scalar(
            r#"
            SELECT text FROM labels
            WHERE environment_id = ?1 AND version_id = ?2 AND label_id = ?3 AND language = ?4
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .bind(&key.label_id)
        .bind(&key.language)
        .fetch_optional(&self.pool)
        .await?;

        Ok(text.map(|text| LabelRecord {
            label_id: key.label_id.clone(),
            language: key.language.clone(),
            text,
        }))
    }

    /// Looks up many keys on one connection. Missing keys are absent from
    /// the returned map.
    pub async fn get_many(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        keys: &[LabelKey],
    ) -> DbResult<HashMap<LabelKey, String>> {
        let mut found = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(found);
        }

        let mut conn = self.pool.acquire().await?;
        for key in keys {
            let text: Option<String> = sqlx::query_scalar(
                r#"
                SELECT text FROM labels
                WHERE environment_id = ?1 AND version_id = ?2 AND label_id = ?3 AND language = ?4
                "#,
            )
            .bind(environment_id)
            .bind(version_id)
            .bind(&key.label_id)
            .bind(&key.language)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(text) = text {
                found.insert(key.clone(), text);
            }
        }
        Ok(found)
    }

    /// Stores resolved labels in one transaction. Returns how many were new.
    pub async fn put_many(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        labels: &[LabelRecord],
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut inserted = 0;

        for label in labels {
            let result = sqlx::query(
                r#"
                INSERT INTO labels (environment_id, version_id, label_id, language, text, resolved_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (environment_id, version_id, label_id, language) DO NOTHING
                "#,
            )
            .bind(environment_id)
            .bind(version_id)
            .bind(&label.label_id)
            .bind(&label.language)
            .bind(&label.text)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        debug!(environment_id, version_id, inserted, "Stored labels");
        Ok(inserted)
    }

    pub async fn count(&self, environment_id: EnvironmentId, version_id: VersionId) -> DbResult<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM labels WHERE environment_id = ?1 AND version_id = ?2",
        )
        .bind(environment_id)
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(n as u64)
    }
}

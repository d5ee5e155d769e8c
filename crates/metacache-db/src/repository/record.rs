//! # Metadata Record Repository
//!
//! Entity, action and enumeration records per (environment, version).
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    upsert (one unit of work)                            │
//! │                                                                         │
//! │  BEGIN                                                                  │
//! │    SELECT existing row (id, indexed fields)                            │
//! │    INSERT or UPDATE metadata_records   (payload = full record JSON)    │
//! │    indexed fields changed or new row?                                  │
//! │       yes ──► SearchIndex::index_record (same connection)              │
//! │  COMMIT                                                                 │
//! │                                                                         │
//! │  WriteGranularity::Record  one transaction per record                  │
//! │  WriteGranularity::Page    one transaction per page of records         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Resolved label text lives in its own column and is overlaid on the
//! payload when a row is read, so a re-sync that does not carry label text
//! keeps the text already resolved for an unchanged label id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, trace};

use crate::error::{DbError, DbResult};
use crate::search::SearchIndex;
use metacache_core::{
    EnvironmentId, IndexedFields, MetadataRecord, RecordKind, VersionId,
};

// =============================================================================
// Types
// =============================================================================

/// A record as read back from the relational tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub environment_id: EnvironmentId,
    pub version_id: VersionId,
    pub record: MetadataRecord,
    pub updated_at: DateTime<Utc>,
}

/// Transaction size used when applying a batch of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteGranularity {
    /// Each record and its index entry commit on their own.
    #[default]
    Record,
    /// A whole page commits or rolls back together.
    Page,
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Row existed; `reindexed` is true when its indexed fields changed.
    Updated { reindexed: bool },
}

#[derive(Debug, FromRow)]
struct RecordRow {
    id: i64,
    environment_id: i64,
    version_id: i64,
    label_text: Option<String>,
    payload: String,
    updated_at: DateTime<Utc>,
}

impl RecordRow {
    fn into_stored(self) -> DbResult<StoredRecord> {
        let mut record: MetadataRecord = serde_json::from_str(&self.payload)
            .map_err(|e| DbError::corrupt("metadata_records", e))?;
        if let (Some(header), Some(text)) = (record.header_mut(), self.label_text) {
            header.label_text = Some(text);
        }
        Ok(StoredRecord {
            id: self.id,
            environment_id: self.environment_id,
            version_id: self.version_id,
            record,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct IndexedRow {
    pub id: i64,
    pub name: String,
    pub public_name: Option<String>,
    pub collection_name: Option<String>,
    pub label_id: Option<String>,
    pub label_text: Option<String>,
    pub category: Option<String>,
}

impl IndexedRow {
    pub fn fields(&self) -> IndexedFields {
        IndexedFields {
            name: self.name.clone(),
            public_name: self.public_name.clone(),
            collection_name: self.collection_name.clone(),
            label_text: self.label_text.clone(),
            category: self.category.clone(),
        }
    }
}

const RECORD_COLUMNS: &str = "id, environment_id, version_id, label_text, payload, updated_at";

pub(crate) const INDEXED_COLUMNS: &str =
    "id, name, public_name, collection_name, label_id, label_text, category";

// =============================================================================
// Repository
// =============================================================================

/// Repository for entity, action and enumeration records.
///
/// Labels are not stored here; see [`crate::LabelRepository`].
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool) -> Self {
        RecordRepository { pool }
    }

    /// Looks up a record in one specific version.
    pub async fn get(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        kind: RecordKind,
        name: &str,
    ) -> DbResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata_records \
             WHERE environment_id = ?1 AND version_id = ?2 AND kind = ?3 AND name = ?4"
        ))
        .bind(environment_id)
        .bind(version_id)
        .bind(kind)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_stored).transpose()
    }

    /// Looks up the newest stored copy of a record across all versions.
    ///
    /// Lets callers tell "never existed" from "exists, but only in an older
    /// version".
    pub async fn get_latest(
        &self,
        environment_id: EnvironmentId,
        kind: RecordKind,
        name: &str,
    ) -> DbResult<Option<StoredRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata_records \
             WHERE environment_id = ?1 AND kind = ?2 AND name = ?3 \
             ORDER BY version_id DESC LIMIT 1"
        ))
        .bind(environment_id)
        .bind(kind)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_stored).transpose()
    }

    /// Inserts or updates one record in its own transaction.
    pub async fn upsert(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        record: &MetadataRecord,
        session_id: Option<&str>,
    ) -> DbResult<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_in(&mut tx, environment_id, version_id, record, session_id).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Applies a batch of records.
    ///
    /// With [`WriteGranularity::Page`] nothing is visible unless every record
    /// applies. With [`WriteGranularity::Record`] an error leaves the records
    /// before it committed.
    pub async fn upsert_batch(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        records: &[MetadataRecord],
        session_id: Option<&str>,
        granularity: WriteGranularity,
    ) -> DbResult<Vec<UpsertOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        match granularity {
            WriteGranularity::Record => {
                for record in records {
                    outcomes.push(
                        self.upsert(environment_id, version_id, record, session_id)
                            .await?,
                    );
                }
            }
            WriteGranularity::Page => {
                let mut tx = self.pool.begin().await?;
                for record in records {
                    outcomes.push(
                        upsert_in(&mut tx, environment_id, version_id, record, session_id)
                            .await?,
                    );
                }
                tx.commit().await?;
            }
        }

        debug!(
            environment_id,
            version_id,
            count = records.len(),
            ?granularity,
            "Applied record batch"
        );
        Ok(outcomes)
    }

    /// Deletes records of `kind` that the given session did not write and
    /// that nothing else wrote since `started_at`.
    ///
    /// Run after a completed full session to drop records removed upstream.
    /// Rows written meanwhile by an overlapping session survive.
    pub async fn delete_untouched(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        kind: RecordKind,
        session_id: &str,
        started_at: DateTime<Utc>,
    ) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM metadata_records
            WHERE environment_id = ?1 AND version_id = ?2 AND kind = ?3
              AND session_id IS NOT ?4
              AND updated_at < ?5
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .bind(kind)
        .bind(session_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Record counts per kind for one version.
    pub async fn count_by_kind(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
    ) -> DbResult<BTreeMap<RecordKind, u64>> {
        let rows: Vec<(RecordKind, i64)> = sqlx::query_as(
            r#"
            SELECT kind, COUNT(*) FROM metadata_records
            WHERE environment_id = ?1 AND version_id = ?2
            GROUP BY kind
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(k, n)| (k, n as u64)).collect())
    }

    pub async fn count(&self, environment_id: EnvironmentId, version_id: VersionId) -> DbResult<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM metadata_records WHERE environment_id = ?1 AND version_id = ?2",
        )
        .bind(environment_id)
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(n as u64)
    }

    /// Finds records whose name matches a SQL `LIKE` pattern (escape `\`).
    ///
    /// Matching is ASCII case-insensitive. Ordered by name, then kind.
    pub async fn find_like(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        like: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> DbResult<Vec<StoredRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM metadata_records \
             WHERE environment_id = ?1 AND version_id = ?2 \
               AND name LIKE ?3 ESCAPE '\\' \
               AND (?4 IS NULL OR kind = ?4) \
             ORDER BY name ASC, kind ASC \
             LIMIT ?5"
        ))
        .bind(environment_id)
        .bind(version_id)
        .bind(like)
        .bind(kind)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecordRow::into_stored).collect()
    }

    /// Label ids referenced by records of a version that have no text yet.
    pub async fn label_ids_without_text(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
    ) -> DbResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT DISTINCT label_id FROM metadata_records
            WHERE environment_id = ?1 AND version_id = ?2
              AND label_id IS NOT NULL AND label_text IS NULL
            ORDER BY label_id
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    /// Sets the resolved text on every record of a version that carries
    /// `label_id`, reindexing each changed row in the same transaction.
    ///
    /// Returns the number of rows changed.
    pub async fn update_label_text(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        label_id: &str,
        text: &str,
    ) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, IndexedRow>(&format!(
            "SELECT {INDEXED_COLUMNS} FROM metadata_records \
             WHERE environment_id = ?1 AND version_id = ?2 AND label_id = ?3 \
               AND (label_text IS NULL OR label_text != ?4)"
        ))
        .bind(environment_id)
        .bind(version_id)
        .bind(label_id)
        .bind(text)
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            sqlx::query("UPDATE metadata_records SET label_text = ?2 WHERE id = ?1")
                .bind(row.id)
                .bind(text)
                .execute(&mut *tx)
                .await?;

            let mut fields = row.fields();
            fields.label_text = Some(text.to_string());
            SearchIndex::index_record(&mut tx, row.id, &fields).await?;
        }

        tx.commit().await?;
        Ok(rows.len() as u64)
    }
}

// =============================================================================
// Unit of Work
// =============================================================================

/// Writes one record and, when needed, its index entry on `conn`.
async fn upsert_in(
    conn: &mut SqliteConnection,
    environment_id: EnvironmentId,
    version_id: VersionId,
    record: &MetadataRecord,
    session_id: Option<&str>,
) -> DbResult<UpsertOutcome> {
    let header = record.header().ok_or_else(|| {
        DbError::QueryFailed("label records belong in the label repository".to_string())
    })?;
    let kind = record.kind();

    let existing = sqlx::query_as::<_, IndexedRow>(&format!(
        "SELECT {INDEXED_COLUMNS} FROM metadata_records \
         WHERE environment_id = ?1 AND version_id = ?2 AND kind = ?3 AND name = ?4"
    ))
    .bind(environment_id)
    .bind(version_id)
    .bind(kind)
    .bind(&header.name)
    .fetch_optional(&mut *conn)
    .await?;

    let mut fields = header.indexed_fields();
    if fields.label_text.is_none() {
        if let Some(row) = existing.as_ref().filter(|r| r.label_id == header.label_id) {
            fields.label_text = row.label_text.clone();
        }
    }

    let payload = serde_json::to_string(record)?;
    let now = Utc::now();

    match existing {
        None => {
            let result = sqlx::query(
                r#"
                INSERT INTO metadata_records (
                    environment_id, version_id, kind, name, public_name, collection_name,
                    category, service_enabled, data_management_enabled, read_only,
                    label_id, label_text, payload, modified_at, session_id, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
            )
            .bind(environment_id)
            .bind(version_id)
            .bind(kind)
            .bind(&header.name)
            .bind(&header.public_name)
            .bind(&header.collection_name)
            .bind(&header.category)
            .bind(header.capabilities.service_enabled)
            .bind(header.capabilities.data_management_enabled)
            .bind(header.capabilities.read_only)
            .bind(&header.label_id)
            .bind(&fields.label_text)
            .bind(&payload)
            .bind(header.modified_at)
            .bind(session_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;

            let id = result.last_insert_rowid();
            SearchIndex::index_record(conn, id, &fields).await?;
            trace!(id, kind = %kind, name = %header.name, "Inserted record");
            Ok(UpsertOutcome::Inserted)
        }
        Some(row) => {
            sqlx::query(
                r#"
                UPDATE metadata_records SET
                    public_name = ?2, collection_name = ?3, category = ?4,
                    service_enabled = ?5, data_management_enabled = ?6, read_only = ?7,
                    label_id = ?8, label_text = ?9, payload = ?10, modified_at = ?11,
                    session_id = ?12, updated_at = ?13
                WHERE id = ?1
                "#,
            )
            .bind(row.id)
            .bind(&header.public_name)
            .bind(&header.collection_name)
            .bind(&header.category)
            .bind(header.capabilities.service_enabled)
            .bind(header.capabilities.data_management_enabled)
            .bind(header.capabilities.read_only)
            .bind(&header.label_id)
            .bind(&fields.label_text)
            .bind(&payload)
            .bind(header.modified_at)
            .bind(session_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;

            let reindexed = row.fields() != fields;
            if reindexed {
                SearchIndex::index_record(conn, row.id, &fields).await?;
            }
            Ok(UpsertOutcome::Updated { reindexed })
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

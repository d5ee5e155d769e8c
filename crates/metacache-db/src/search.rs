//! # Search Index
//!
//! Lexical index over the text fields of entity, action and enumeration
//! records, backed by an FTS5 virtual table whose rowid is the record id.
//!
//! ## How Search Works
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    search("customer", kind?, limit)                     │
//! │                                                                         │
//! │  1. Exact candidates (uncapped)                                        │
//! │     lower(name) = 'customer' OR lower(public_name) = ...               │
//! │  2. FTS5 candidates (capped)                                           │
//! │     metadata_search MATCH '"customer"*'   (name, public_name, ...,     │
//! │                                            camel-case terms)           │
//! │  3. Substring candidates (capped, heaviest field first)                │
//! │     name / public_name / ... LIKE '%customer%'                         │
//! │       (FTS tokens miss "customer" inside "MyCustomerTable")            │
//! │  4. Score each candidate in Rust                                       │
//! │     exact field (3) > substring (2) > prefix / stem (1)                │
//! │     then field weight: name > public_name > collection > label > cat  │
//! │  5. Sort by relevance, name, kind ── deterministic                     │
//! │  6. Snippet around the match in the winning field                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Index Maintenance
//! Writers call [`SearchIndex::index_record`] on the connection of their own
//! transaction, so an entry is never visible apart from its record. A delete
//! trigger removes entries with their rows. [`SearchIndex::rebuild`] is for
//! maintenance only.

use std::collections::HashSet;

use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::error::DbResult;
use crate::repository::record::{IndexedRow, INDEXED_COLUMNS};
use metacache_core::lexical::{
    fts_match_expression, index_terms, rank_hits, score_fields, snippet, SNIPPET_RADIUS,
};
use metacache_core::{EnvironmentId, IndexedFields, RecordKind, SearchHit, VersionId};

/// Lower bound on candidates fetched per strategy before scoring.
const MIN_CANDIDATES: usize = 200;

#[derive(Debug, FromRow)]
struct CandidateRow {
    id: i64,
    kind: RecordKind,
    name: String,
    public_name: Option<String>,
    collection_name: Option<String>,
    label_text: Option<String>,
    category: Option<String>,
}

impl CandidateRow {
    fn fields(&self) -> IndexedFields {
        IndexedFields {
            name: self.name.clone(),
            public_name: self.public_name.clone(),
            collection_name: self.collection_name.clone(),
            label_text: self.label_text.clone(),
            category: self.category.clone(),
        }
    }
}

/// Lexical index over metadata records.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool) -> Self {
        SearchIndex { pool }
    }

    /// Replaces the index entry of one record.
    ///
    /// Takes the writer's connection so the entry commits with the record.
    pub async fn index_record(
        conn: &mut SqliteConnection,
        record_id: i64,
        fields: &IndexedFields,
    ) -> DbResult<()> {
        let terms = index_terms(fields.weighted().into_iter().map(|(_, value)| value));

        sqlx::query("DELETE FROM metadata_search WHERE rowid = ?1")
            .bind(record_id)
            .execute(&mut *conn)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO metadata_search (
                rowid, name, public_name, collection_name, label_text, category, terms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record_id)
        .bind(&fields.name)
        .bind(&fields.public_name)
        .bind(&fields.collection_name)
        .bind(&fields.label_text)
        .bind(&fields.category)
        .bind(terms)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// Searches one version of an environment.
    ///
    /// Returns hits ordered by relevance, then name, then kind. An empty or
    /// unmatched query yields an empty list.
    pub async fn search(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        text: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> DbResult<Vec<SearchHit>> {
        let query = text.trim();
        if query.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let cap = limit.saturating_mul(10).max(MIN_CANDIDATES) as i64;

        let mut conn = self.pool.acquire().await?;

        // Exact field matches are never capped; they outrank everything else.
        let mut candidates = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT id, kind, name, public_name, collection_name, label_text, category
            FROM metadata_records
            WHERE environment_id = ?1 AND version_id = ?2
              AND (?3 IS NULL OR kind = ?3)
              AND (lower(name) = ?4
                   OR lower(public_name) = ?4
                   OR lower(collection_name) = ?4
                   OR lower(label_text) = ?4
                   OR lower(category) = ?4)
            ORDER BY name, kind
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .bind(kind)
        .bind(query.to_lowercase())
        .fetch_all(&mut *conn)
        .await?;

        if let Some(expression) = fts_match_expression(query) {
            let matched = sqlx::query_as::<_, CandidateRow>(
                r#"
                SELECT r.id, r.kind, r.name, r.public_name, r.collection_name,
                       r.label_text, r.category
                FROM metadata_search
                INNER JOIN metadata_records r ON r.id = metadata_search.rowid
                WHERE metadata_search MATCH ?1
                  AND r.environment_id = ?2 AND r.version_id = ?3
                  AND (?4 IS NULL OR r.kind = ?4)
                ORDER BY metadata_search.rank, r.name, r.kind
                LIMIT ?5
                "#,
            )
            .bind(&expression)
            .bind(environment_id)
            .bind(version_id)
            .bind(kind)
            .bind(cap)
            .fetch_all(&mut *conn)
            .await?;
            candidates.extend(matched);
        }

        let like = format!("%{}%", escape_like(query));
        let substring = sqlx::query_as::<_, CandidateRow>(
            r#"
            SELECT id, kind, name, public_name, collection_name, label_text, category
            FROM metadata_records
            WHERE environment_id = ?1 AND version_id = ?2
              AND (?3 IS NULL OR kind = ?3)
              AND (name LIKE ?4 ESCAPE '\'
                   OR public_name LIKE ?4 ESCAPE '\'
                   OR collection_name LIKE ?4 ESCAPE '\'
                   OR label_text LIKE ?4 ESCAPE '\'
                   OR category LIKE ?4 ESCAPE '\')
            ORDER BY CASE
                       WHEN name LIKE ?4 ESCAPE '\' THEN 0
                       WHEN public_name LIKE ?4 ESCAPE '\' THEN 1
                       WHEN collection_name LIKE ?4 ESCAPE '\' THEN 2
                       WHEN label_text LIKE ?4 ESCAPE '\' THEN 3
                       ELSE 4
                     END,
                     name, kind
            LIMIT ?5
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .bind(kind)
        .bind(&like)
        .bind(cap)
        .fetch_all(&mut *conn)
        .await?;

        let mut seen: HashSet<i64> = HashSet::new();
        candidates.retain(|c| seen.insert(c.id));
        candidates.extend(substring.into_iter().filter(|c| seen.insert(c.id)));

        let mut hits: Vec<SearchHit> = candidates
            .iter()
            .filter_map(|candidate| {
                let fields = candidate.fields();
                let weighted = fields.weighted();
                let matched = score_fields(query, &weighted)?;
                let text = weighted
                    .iter()
                    .find(|(field, _)| *field == matched.field)
                    .map(|(_, value)| *value)
                    .unwrap_or(candidate.name.as_str());
                Some(SearchHit {
                    kind: candidate.kind,
                    name: candidate.name.clone(),
                    relevance: matched.relevance(),
                    tier: matched.tier,
                    field: matched.field.to_string(),
                    snippet: snippet(text, query, SNIPPET_RADIUS),
                })
            })
            .collect();

        rank_hits(&mut hits);
        hits.truncate(limit);

        debug!(
            query = %query,
            candidates = candidates.len(),
            hits = hits.len(),
            "Search complete"
        );
        Ok(hits)
    }

    /// Drops and rebuilds every index entry from the record table.
    ///
    /// Returns the number of entries written.
    pub async fn rebuild(&self) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM metadata_search")
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, IndexedRow>(&format!(
            "SELECT {INDEXED_COLUMNS} FROM metadata_records ORDER BY id"
        ))
        .fetch_all(&mut *tx)
        .await?;

        for row in &rows {
            Self::index_record(&mut tx, row.id, &row.fields()).await?;
        }

        tx.commit().await?;

        info!(entries = rows.len(), "Search index rebuilt");
        Ok(rows.len() as u64)
    }

    /// Number of index entries for one version.
    pub async fn size(&self, environment_id: EnvironmentId, version_id: VersionId) -> DbResult<u64> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM metadata_search
            INNER JOIN metadata_records r ON r.id = metadata_search.rowid
            WHERE r.environment_id = ?1 AND r.version_id = ?2
            "#,
        )
        .bind(environment_id)
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(n as u64)
    }

    /// Number of index entries across all environments.
    pub async fn total_size(&self) -> DbResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata_search")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::record::WriteGranularity;
    use crate::repository::test_support::*;
    use metacache_core::{
        ActionRecord, MatchTier, MetadataRecord, RecordHeader,
    };

    async fn seeded() -> (crate::Database, EnvironmentId, VersionId) {
        let db = setup().await;
        let (env, v1) = env_with_version(&db, "10.0.38").await;
        let records = vec![
            entity("CustomersV3", Some("Customer"), Some("@SYS1")),
            entity("CustTable", Some("CustTable"), None),
            entity("VendorsV2", Some("Vendor"), None),
            entity("SalesOrderHeadersV2", Some("SalesOrderHeader"), None),
            MetadataRecord::Action(ActionRecord {
                header: RecordHeader::named("customers_post"),
                parameters: Vec::new(),
                return_type: None,
            }),
        ];
        for record in &records {
            db.records().upsert(env.id, v1.id, record, None).await.unwrap();
        }
        (db, env.id, v1.id)
    }

    #[tokio::test]
    async fn test_exact_above_substring_above_prefix() {
        let (db, env, v1) = seeded().await;
        let index = db.search();

        let hits = index.search(env, v1, "Customer", None, 10).await.unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.name.as_str()).collect();

        // public_name == "Customer" is exact; "customers_post" contains it.
        assert_eq!(names[0], "CustomersV3");
        assert_eq!(hits[0].tier, MatchTier::Exact);
        assert_eq!(hits[0].field, "public_name");
        assert!(names.contains(&"customers_post"));
        assert!(!names.contains(&"VendorsV2"));
        assert!(hits.windows(2).all(|w| w[0].relevance >= w[1].relevance));
    }

    #[tokio::test]
    async fn test_exact_match_survives_many_substring_matches() {
        let db = setup().await;
        let (env, v1) = env_with_version(&db, "10.0.38").await;
        let decoys: Vec<MetadataRecord> = (0..400)
            .map(|i| entity(&format!("CustomerCustomerCustomer{i:03}"), None, None))
            .collect();
        db.records()
            .upsert_batch(env.id, v1.id, &decoys, None, WriteGranularity::Page)
            .await
            .unwrap();
        db.records()
            .upsert(env.id, v1.id, &entity("ZzTable", Some("customer"), None), None)
            .await
            .unwrap();

        let hits = db.search().search(env.id, v1.id, "customer", None, 5).await.unwrap();

        assert_eq!(hits.len(), 5);
        assert_eq!(hits[0].name, "ZzTable");
        assert_eq!(hits[0].tier, MatchTier::Exact);
        assert_eq!(hits[0].field, "public_name");
        assert!(hits[1..].iter().all(|h| h.tier == MatchTier::Substring));
        assert_eq!(hits[1].name, "CustomerCustomerCustomer000");
    }

    #[tokio::test]
    async fn test_camel_case_prefix_match() {
        let (db, env, v1) = seeded().await;

        let hits = db
            .search()
            .search(env, v1, "sales header", None, 10)
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "SalesOrderHeadersV2");
        assert_eq!(hits[0].tier, MatchTier::Prefix);
    }

    #[tokio::test]
    async fn test_kind_filter_and_limit() {
        let (db, env, v1) = seeded().await;
        let index = db.search();

        let actions = index
            .search(env, v1, "customer", Some(RecordKind::Action), 10)
            .await
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, RecordKind::Action);

        let limited = index.search(env, v1, "customer", None, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_not_error() {
        let (db, env, v1) = seeded().await;
        let index = db.search();

        assert!(index.search(env, v1, "zzz", None, 10).await.unwrap().is_empty());
        assert!(index.search(env, v1, "   ", None, 10).await.unwrap().is_empty());
        assert!(index.search(env, v1, "\"*(", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_are_deterministic() {
        let (db, env, v1) = seeded().await;
        let index = db.search();

        let first = index.search(env, v1, "cust", None, 10).await.unwrap();
        let second = index.search(env, v1, "cust", None, 10).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_label_text_is_searchable_after_update() {
        let (db, env, v1) = seeded().await;
        db.records()
            .update_label_text(env, v1, "@SYS1", "Customer accounts")
            .await
            .unwrap();

        let hits = db.search().search(env, v1, "accounts", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].field, "label_text");
        assert!(hits[0].snippet.contains("accounts"));
    }

    #[tokio::test]
    async fn test_rebuild_and_size() {
        let (db, env, v1) = seeded().await;
        let index = db.search();

        assert_eq!(index.size(env, v1).await.unwrap(), 5);
        sqlx::query("DELETE FROM metadata_search")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(index.total_size().await.unwrap(), 0);

        assert_eq!(index.rebuild().await.unwrap(), 5);
        assert_eq!(index.size(env, v1).await.unwrap(), 5);
        assert!(!index.search(env, v1, "vendor", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pruned_version_leaves_no_entries() {
        let (db, env, v1) = seeded().await;
        let v2 = db.versions().upsert(env, &version("10.0.39")).await.unwrap();
        db.versions().prune(env, 1, Some(v2.id)).await.unwrap();

        assert_eq!(db.search().total_size().await.unwrap(), 0);
        assert!(db.search().search(env, v1, "customer", None, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }
}

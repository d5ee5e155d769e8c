//! # Tiered Store
//!
//! Read path across the three tiers and the write path into them.
//!
//! ## Read Path
//! ```text
//! get(env, version, kind, key)
//!   │
//!   ├─► in-process tier ── hit ──────────────────────────► Found(Memory)
//!   │
//!   ├─► disk tier ──────── hit ─► promote to memory ─────► Found(Disk)
//!   │
//!   ├─► relational tier ── hit ─► promote to disk+memory ► Found(Relational)
//!   │
//!   └─► miss
//!         ├── row exists under an older version ─────────► NotFound(Stale)
//!         ├── environment never synced ──────────────────► NotFound(NeverSynced)
//!         └── otherwise ─────────────────────────────────► NotFound(Absent)
//! ```
//!
//! ## Write Path
//! ```text
//! put(record)  ──► relational tier (record + search index, one transaction)
//!              ──► drop the key from disk and memory tiers
//! ```
//!
//! The relational write always comes first, so a crash in between leaves
//! only the faster tiers behind, and those are keyed by version. The disk
//! and memory tiers are pure accelerators: disabling either changes latency,
//! never results.
//!
//! ## Write Epochs
//! Every write bumps the environment's epoch after committing and before
//! evicting. A reader snapshots the epoch before reading a slower tier and
//! promotes only if it is unchanged; it checks again after promoting and
//! undoes the promotion if a writer ran meanwhile. A copy read before a
//! commit therefore never outlives that commit's eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::cache::{MemoryTier, TierKey};
use crate::disk::DiskTier;
use crate::error::MetaResult;
use metacache_core::{
    Environment, EnvironmentId, LabelKey, MetadataRecord, RecordKind, StoredVersion, VersionId,
};
use metacache_db::{Database, UpsertOutcome, WriteGranularity};

// =============================================================================
// Lookup Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Memory,
    Disk,
    Relational,
}

/// Why a lookup found nothing. Never an error: callers decide whether to
/// start a sync, wait, or show the raw key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum MissReason {
    /// The current version has no such record.
    Absent,
    /// The environment has not completed a sync for its current version.
    NeverSynced,
    /// The record exists, but only under an older version.
    Stale {
        cached_version: VersionId,
        current_version: VersionId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found {
        record: Arc<MetadataRecord>,
        tier: Tier,
    },
    NotFound {
        reason: MissReason,
    },
}

impl Lookup {
    pub fn record(&self) -> Option<&MetadataRecord> {
        match self {
            Lookup::Found { record, .. } => Some(record),
            Lookup::NotFound { .. } => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found { .. })
    }

    /// True when a sync would change the answer.
    pub fn needs_sync(&self) -> bool {
        matches!(
            self,
            Lookup::NotFound {
                reason: MissReason::NeverSynced | MissReason::Stale { .. }
            }
        )
    }

    /// A user-facing hint for misses that a sync would fix.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Lookup::NotFound {
                reason: MissReason::NeverSynced,
            } => Some("metadata for this environment has not been synced yet; start a sync"),
            Lookup::NotFound {
                reason: MissReason::Stale { .. },
            } => Some("cached metadata belongs to an older version; a sync will refresh it"),
            _ => None,
        }
    }
}

// =============================================================================
// Counters
// =============================================================================

#[derive(Debug, Default)]
struct TierCounters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    relational_hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time copy of the hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub relational_hits: u64,
    pub misses: u64,
}

impl CacheCounters {
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.disk_hits + self.relational_hits
    }
}

/// What an invalidation dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub memory_entries: usize,
    pub disk_entries: usize,
    pub pruned_versions: Vec<VersionId>,
}

// =============================================================================
// Tiered Store
// =============================================================================

pub struct TieredStore {
    db: Database,
    memory: MemoryTier,
    disk: Option<DiskTier>,
    counters: TierCounters,
    /// environment -> number of writes that evicted fast-tier copies
    epochs: Mutex<HashMap<EnvironmentId, u64>>,
}

impl TieredStore {
    pub fn new(db: Database, memory: MemoryTier, disk: Option<DiskTier>) -> Self {
        TieredStore {
            db,
            memory,
            disk,
            counters: TierCounters::default(),
            epochs: Mutex::new(HashMap::new()),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Looks a record up in `version`, probing the fastest tier first.
    ///
    /// Label keys use the `language/label_id` form.
    pub async fn get(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) -> MetaResult<Lookup> {
        let tier_key = TierKey::new(env.id, version.id, kind, key);

        if let Some(record) = self.memory.get(&tier_key) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            trace!(%kind, key, "In-process tier hit");
            return Ok(Lookup::Found {
                record,
                tier: Tier::Memory,
            });
        }

        let epoch = self.write_epoch(env.id);

        if let Some(disk) = &self.disk {
            match disk.get(env, version, kind, key).await {
                Ok(Some(record)) => {
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    trace!(%kind, key, "Disk tier hit");
                    let record = Arc::new(record);
                    self.promote(env, version, &tier_key, &record, epoch, false)
                        .await;
                    return Ok(Lookup::Found {
                        record,
                        tier: Tier::Disk,
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(%kind, key, error = %e, "Disk tier read failed"),
            }
        }

        if let Some(record) = self.get_relational(env, version, kind, key).await? {
            self.counters.relational_hits.fetch_add(1, Ordering::Relaxed);
            let record = Arc::new(record);
            self.promote(env, version, &tier_key, &record, epoch, true)
                .await;
            return Ok(Lookup::Found {
                record,
                tier: Tier::Relational,
            });
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let reason = self.miss_reason(env, version, kind, key).await?;
        debug!(environment_id = env.id, %kind, key, ?reason, "Lookup miss");
        Ok(Lookup::NotFound { reason })
    }

    /// Copies a record read from a slower tier into the faster ones, unless
    /// a write for the environment ran since `epoch` was taken.
    async fn promote(
        &self,
        env: &Environment,
        version: &StoredVersion,
        tier_key: &TierKey,
        record: &Arc<MetadataRecord>,
        epoch: u64,
        to_disk: bool,
    ) {
        if self.write_epoch(env.id) != epoch {
            trace!(kind = %tier_key.kind, key = %tier_key.key, "Write since read, not promoting");
            return;
        }

        if to_disk {
            if let Some(disk) = &self.disk {
                if let Err(e) = disk.put(env, version, record).await {
                    warn!(kind = %tier_key.kind, key = %tier_key.key, error = %e, "Disk tier write failed");
                }
            }
        }
        self.memory.insert(tier_key.clone(), Arc::clone(record));

        if self.write_epoch(env.id) != epoch {
            debug!(kind = %tier_key.kind, key = %tier_key.key, "Write raced promotion, dropping copy");
            self.evict_key(env, version, tier_key.kind, &tier_key.key).await;
        }
    }

    fn write_epoch(&self, environment_id: EnvironmentId) -> u64 {
        self.epochs.lock().get(&environment_id).copied().unwrap_or(0)
    }

    fn bump_epoch(&self, environment_id: EnvironmentId) {
        *self.epochs.lock().entry(environment_id).or_default() += 1;
    }

    async fn get_relational(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) -> MetaResult<Option<MetadataRecord>> {
        if kind == RecordKind::Label {
            let label_key = LabelKey::parse(key)?;
            let label = self.db.labels().get(env.id, version.id, &label_key).await?;
            return Ok(label.map(MetadataRecord::Label));
        }

        let stored = self.db.records().get(env.id, version.id, kind, key).await?;
        Ok(stored.map(|s| s.record))
    }

    async fn miss_reason(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) -> MetaResult<MissReason> {
        if kind.is_indexed() {
            if let Some(older) = self.db.records().get_latest(env.id, kind, key).await? {
                if older.version_id != version.id {
                    return Ok(MissReason::Stale {
                        cached_version: older.version_id,
                        current_version: version.id,
                    });
                }
            }
        }

        if env.current_version_id == Some(version.id) && env.has_synced() {
            Ok(MissReason::Absent)
        } else {
            Ok(MissReason::NeverSynced)
        }
    }

    /// Writes one record to the relational tier, then drops its fast-tier copies.
    pub async fn put(
        &self,
        env: &Environment,
        version: &StoredVersion,
        record: &MetadataRecord,
        session_id: Option<&str>,
    ) -> MetaResult<UpsertOutcome> {
        let outcome = match record {
            MetadataRecord::Label(label) => {
                let inserted = self
                    .db
                    .labels()
                    .put_many(env.id, version.id, std::slice::from_ref(label))
                    .await?;
                if inserted > 0 {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated { reindexed: false }
                }
            }
            other => {
                self.db
                    .records()
                    .upsert(env.id, version.id, other, session_id)
                    .await?
            }
        };

        self.bump_epoch(env.id);
        self.evict_key(env, version, record.kind(), &record.key()).await;
        Ok(outcome)
    }

    /// Writes a page of entity/action/enumeration records.
    pub async fn put_batch(
        &self,
        env: &Environment,
        version: &StoredVersion,
        records: &[MetadataRecord],
        session_id: Option<&str>,
        granularity: WriteGranularity,
    ) -> MetaResult<Vec<UpsertOutcome>> {
        let outcomes = self
            .db
            .records()
            .upsert_batch(env.id, version.id, records, session_id, granularity)
            .await?;

        self.bump_epoch(env.id);
        for record in records {
            self.evict_key(env, version, record.kind(), &record.key()).await;
        }
        Ok(outcomes)
    }

    async fn evict_key(&self, env: &Environment, version: &StoredVersion, kind: RecordKind, key: &str) {
        self.memory
            .remove(&TierKey::new(env.id, version.id, kind, key));
        if let Some(disk) = &self.disk {
            disk.remove(env, version, kind, key).await;
        }
    }

    /// Drops the environment from the in-process and disk tiers.
    pub async fn invalidate_fast(&self, env: &Environment) -> MetaResult<InvalidationReport> {
        self.bump_epoch(env.id);
        let memory_entries = self.memory.invalidate_environment(env.id);
        let disk_entries = match &self.disk {
            Some(disk) => disk.invalidate_environment(env).await?,
            None => 0,
        };
        Ok(InvalidationReport {
            memory_entries,
            disk_entries,
            pruned_versions: Vec::new(),
        })
    }

    /// Drops the fast tiers and, with `retain`, relational rows of versions
    /// beyond the newest `retain` (the current version is always kept).
    pub async fn invalidate(
        &self,
        env: &Environment,
        retain: Option<usize>,
    ) -> MetaResult<InvalidationReport> {
        let mut report = self.invalidate_fast(env).await?;
        if let Some(retain) = retain {
            report.pruned_versions = self
                .db
                .versions()
                .prune(env.id, retain, env.current_version_id)
                .await?;
        }
        debug!(
            environment_id = env.id,
            memory = report.memory_entries,
            disk = report.disk_entries,
            pruned = report.pruned_versions.len(),
            "Environment invalidated"
        );
        Ok(report)
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            relational_hits: self.counters.relational_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }

    pub fn memory_entries(&self) -> u64 {
        self.memory.len()
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk.as_ref().map(DiskTier::bytes).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::version;
    use chrono::Utc;
    use metacache_core::{DataEntityRecord, LabelRecord, RecordHeader};
    use metacache_db::DbConfig;

    fn entity(name: &str) -> MetadataRecord {
        let mut header = RecordHeader::named(name);
        header.public_name = Some(name.trim_end_matches('s').to_string());
        header.category = Some("Master".into());
        MetadataRecord::DataEntity(DataEntityRecord { header })
    }

    async fn setup(disk: Option<DiskTier>) -> (TieredStore, Environment, StoredVersion) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let env = db.environments().get_or_create("https://erp.example.com").await.unwrap();
        let v1 = db.versions().upsert(env.id, &version("1")).await.unwrap();
        db.environments().set_current_version(env.id, v1.id).await.unwrap();
        let env = db.environments().get(env.id).await.unwrap().unwrap();
        (TieredStore::new(db, MemoryTier::new(100), disk), env, v1)
    }

    async fn advance(store: &TieredStore, env: &Environment, app: &str) -> (Environment, StoredVersion) {
        let db = store.db();
        let v = db.versions().upsert(env.id, &version(app)).await.unwrap();
        db.environments().set_current_version(env.id, v.id).await.unwrap();
        (db.environments().get(env.id).await.unwrap().unwrap(), v)
    }

    #[tokio::test]
    async fn test_read_after_write_then_promotion() {
        let (store, env, v1) = setup(None).await;
        let record = entity("CustomersV3");

        store.put(&env, &v1, &record, None).await.unwrap();

        let first = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(first.record(), Some(&record));
        assert!(matches!(first, Lookup::Found { tier: Tier::Relational, .. }));

        let second = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(second.record(), Some(&record));
        assert!(matches!(second, Lookup::Found { tier: Tier::Memory, .. }));

        let counters = store.counters();
        assert_eq!(counters.relational_hits, 1);
        assert_eq!(counters.memory_hits, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_promoted_copy() {
        let (store, env, v1) = setup(None).await;
        store.put(&env, &v1, &entity("CustomersV3"), None).await.unwrap();
        store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();

        let mut changed = entity("CustomersV3");
        changed.header_mut().unwrap().category = Some("Transaction".into());
        store.put(&env, &v1, &changed, None).await.unwrap();

        let lookup = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(lookup.record(), Some(&changed));
    }

    #[tokio::test]
    async fn test_write_between_read_and_promotion_wins() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        let (store, env, v1) = setup(Some(disk)).await;
        let original = entity("CustomersV3");
        store.put(&env, &v1, &original, None).await.unwrap();

        // A reader takes the epoch and reads the relational row...
        let epoch = store.write_epoch(env.id);
        let read = Arc::new(
            store
                .get_relational(&env, &v1, RecordKind::DataEntity, "CustomersV3")
                .await
                .unwrap()
                .unwrap(),
        );

        // ...a writer commits a newer copy...
        let mut changed = entity("CustomersV3");
        changed.header_mut().unwrap().category = Some("Transaction".into());
        store.put(&env, &v1, &changed, None).await.unwrap();

        // ...and the reader's promotion must not resurrect the old copy.
        let tier_key = TierKey::new(env.id, v1.id, RecordKind::DataEntity, "CustomersV3");
        store.promote(&env, &v1, &tier_key, &read, epoch, true).await;
        assert_eq!(store.memory_entries(), 0);
        assert_eq!(store.disk_bytes(), 0);

        let lookup = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(lookup.record(), Some(&changed));
        assert!(matches!(lookup, Lookup::Found { tier: Tier::Relational, .. }));
        let again = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(again.record(), Some(&changed));
        assert!(matches!(again, Lookup::Found { tier: Tier::Memory, .. }));
    }

    #[tokio::test]
    async fn test_version_advance_reports_stale() {
        let (store, env, v1) = setup(None).await;
        store.put(&env, &v1, &entity("CustomersV3"), None).await.unwrap();
        store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();

        let (env, v2) = advance(&store, &env, "2").await;
        let lookup = store.get(&env, &v2, RecordKind::DataEntity, "CustomersV3").await.unwrap();

        assert_eq!(
            lookup,
            Lookup::NotFound {
                reason: MissReason::Stale {
                    cached_version: v1.id,
                    current_version: v2.id,
                }
            }
        );
        assert!(lookup.needs_sync());

        store.put(&env, &v2, &entity("CustomersV3"), None).await.unwrap();
        let lookup = store.get(&env, &v2, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert!(lookup.is_found());
    }

    #[tokio::test]
    async fn test_never_synced_and_absent() {
        let (store, env, v1) = setup(None).await;

        let lookup = store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(lookup, Lookup::NotFound { reason: MissReason::NeverSynced });
        assert!(lookup.hint().is_some());

        store.db().environments().mark_synced(env.id, Utc::now()).await.unwrap();
        let env = store.db().environments().get(env.id).await.unwrap().unwrap();
        let lookup = store.get(&env, &v1, RecordKind::DataEntity, "Nope").await.unwrap();
        assert_eq!(lookup, Lookup::NotFound { reason: MissReason::Absent });
        assert!(!lookup.needs_sync());
        assert_eq!(store.counters().misses, 2);
    }

    #[tokio::test]
    async fn test_disk_tier_survives_memory_loss() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        let (store, env, v1) = setup(Some(disk)).await;

        store.put(&env, &v1, &entity("CustomersV3"), None).await.unwrap();
        store.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert!(store.disk_bytes() > 0);

        // Same relational tier, cold memory tier, warm disk tier.
        let reopened = TieredStore::new(
            store.db().clone(),
            MemoryTier::new(100),
            Some(DiskTier::open(dir.path(), 1 << 20).await.unwrap()),
        );
        let lookup = reopened.get(&env, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert!(matches!(lookup, Lookup::Found { tier: Tier::Disk, .. }));
    }

    #[tokio::test]
    async fn test_labels_through_store() {
        let (store, env, v1) = setup(None).await;
        let label = MetadataRecord::Label(LabelRecord {
            label_id: "@SYS1".into(),
            language: "en-US".into(),
            text: "Customers".into(),
        });

        assert_eq!(store.put(&env, &v1, &label, None).await.unwrap(), UpsertOutcome::Inserted);
        let lookup = store.get(&env, &v1, RecordKind::Label, "en-US/@SYS1").await.unwrap();
        assert_eq!(lookup.record(), Some(&label));

        assert!(store.get(&env, &v1, RecordKind::Label, "no-slash").await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_with_retention() {
        let dir = tempfile::tempdir().unwrap();
        let disk = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        let (store, env, v1) = setup(Some(disk)).await;
        store.put(&env, &v1, &entity("A"), None).await.unwrap();
        store.get(&env, &v1, RecordKind::DataEntity, "A").await.unwrap();

        let (env, v2) = advance(&store, &env, "2").await;
        store.put(&env, &v2, &entity("A"), None).await.unwrap();

        let report = store.invalidate(&env, Some(1)).await.unwrap();
        assert_eq!(report.memory_entries, 1);
        assert_eq!(report.disk_entries, 1);
        assert_eq!(report.pruned_versions, vec![v1.id]);
        assert_eq!(store.disk_bytes(), 0);

        let lookup = store.get(&env, &v2, RecordKind::DataEntity, "A").await.unwrap();
        assert!(lookup.is_found());
    }
}

//! # In-Process Tier
//!
//! Bounded least-recently-used map of decoded records, keyed by
//! (environment, version, kind, key). Values are shared `Arc`s so a hit
//! never clones a record.
//!
//! Volatile by nature: nothing here is ever the only copy of a record.

use std::sync::Arc;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::debug;

use metacache_core::{EnvironmentId, MetadataRecord, RecordKind, VersionId};

/// Cache key of a record in the fast tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TierKey {
    pub environment_id: EnvironmentId,
    pub version_id: VersionId,
    pub kind: RecordKind,
    pub key: String,
}

impl TierKey {
    pub fn new(
        environment_id: EnvironmentId,
        version_id: VersionId,
        kind: RecordKind,
        key: impl Into<String>,
    ) -> Self {
        TierKey {
            environment_id,
            version_id,
            kind,
            key: key.into(),
        }
    }
}

pub struct MemoryTier {
    cache: Cache<TierKey, Arc<MetadataRecord>>,
}

impl MemoryTier {
    pub fn new(capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        MemoryTier { cache }
    }

    pub fn get(&self, key: &TierKey) -> Option<Arc<MetadataRecord>> {
        self.cache.get(key)
    }

    pub fn insert(&self, key: TierKey, record: Arc<MetadataRecord>) {
        self.cache.insert(key, record);
    }

    pub fn remove(&self, key: &TierKey) {
        self.cache.invalidate(key);
    }

    /// Drops every entry of one environment, all versions.
    pub fn invalidate_environment(&self, environment_id: EnvironmentId) -> usize {
        let doomed: Vec<TierKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.environment_id == environment_id)
            .map(|(key, _)| TierKey::clone(&key))
            .collect();

        for key in &doomed {
            self.cache.invalidate(key);
        }

        debug!(environment_id, dropped = doomed.len(), "In-process tier invalidated");
        doomed.len()
    }

    /// Approximate entry count (pending maintenance is flushed first).
    pub fn len(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metacache_core::{DataEntityRecord, RecordHeader};

    fn record(name: &str) -> Arc<MetadataRecord> {
        Arc::new(MetadataRecord::DataEntity(DataEntityRecord {
            header: RecordHeader::named(name),
        }))
    }

    #[test]
    fn test_insert_get_remove() {
        let tier = MemoryTier::new(100);
        let key = TierKey::new(1, 1, RecordKind::DataEntity, "CustomersV3");

        assert!(tier.get(&key).is_none());
        tier.insert(key.clone(), record("CustomersV3"));
        assert_eq!(tier.get(&key).unwrap().name(), "CustomersV3");

        // Same name under another version is a different entry.
        assert!(tier.get(&TierKey::new(1, 2, RecordKind::DataEntity, "CustomersV3")).is_none());

        tier.remove(&key);
        assert!(tier.get(&key).is_none());
    }

    #[test]
    fn test_invalidate_environment_keeps_others() {
        let tier = MemoryTier::new(100);
        tier.insert(TierKey::new(1, 1, RecordKind::DataEntity, "A"), record("A"));
        tier.insert(TierKey::new(1, 2, RecordKind::Action, "B"), record("B"));
        tier.insert(TierKey::new(2, 3, RecordKind::DataEntity, "A"), record("A"));

        assert_eq!(tier.invalidate_environment(1), 2);
        assert!(tier.get(&TierKey::new(2, 3, RecordKind::DataEntity, "A")).is_some());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let tier = MemoryTier::new(10);
        for i in 0..100 {
            tier.insert(
                TierKey::new(1, 1, RecordKind::DataEntity, format!("E{i}")),
                record(&format!("E{i}")),
            );
        }
        assert!(tier.len() <= 10);
    }
}

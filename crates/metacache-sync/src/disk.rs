//! # Disk Tier
//!
//! Serialized records on the local filesystem, one JSON file per record.
//!
//! ## Layout
//! ```text
//! <root>/
//! └── <sha256(base_url)[..16]>/          one directory per environment
//!     └── <sha256(fingerprint)[..16]>/   one directory per metadata version
//!         ├── data_entity/
//!         │   └── <sha256(key)>.json     {"kind", "key", "record"}
//!         ├── action/
//!         ├── enumeration/
//!         └── label/
//! ```
//!
//! The whole tree is disposable: deleting it is a cold start, never a
//! correctness problem. Files are written to a temporary name and renamed
//! into place, so a reader sees either the old or the new content.
//!
//! ## Budget
//! Total bytes are tracked in memory. When a write pushes the total over the
//! budget, the oldest writes are deleted first until it fits again.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::MetaResult;
use metacache_core::{Environment, MetadataRecord, RecordKind, StoredVersion};

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    kind: RecordKind,
    key: String,
    record: MetadataRecord,
}

/// Byte accounting and write order of the files on disk.
#[derive(Debug, Default)]
struct DiskIndex {
    /// path -> (size, write sequence)
    files: HashMap<PathBuf, (u64, u64)>,
    /// write sequence -> path, oldest first
    order: BTreeMap<u64, PathBuf>,
    bytes: u64,
    next_seq: u64,
}

impl DiskIndex {
    fn record(&mut self, path: PathBuf, size: u64) {
        self.forget(&path);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.bytes += size;
        self.order.insert(seq, path.clone());
        self.files.insert(path, (size, seq));
    }

    fn forget(&mut self, path: &Path) {
        if let Some((size, seq)) = self.files.remove(path) {
            self.bytes -= size;
            self.order.remove(&seq);
        }
    }

    /// Pops oldest entries until the total fits in `budget`.
    fn evict_to(&mut self, budget: u64) -> Vec<PathBuf> {
        let mut victims = Vec::new();
        while self.bytes > budget {
            let Some((_, path)) = self.order.pop_first() else {
                break;
            };
            if let Some((size, _)) = self.files.remove(&path) {
                self.bytes -= size;
            }
            victims.push(path);
        }
        victims
    }

    fn forget_under(&mut self, dir: &Path) -> usize {
        let doomed: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();
        for path in &doomed {
            self.forget(path);
        }
        doomed.len()
    }
}

pub struct DiskTier {
    root: PathBuf,
    budget: u64,
    index: Mutex<DiskIndex>,
}

impl DiskTier {
    /// Opens (or creates) the tier at `root`, accounting for files already there.
    pub async fn open(root: impl Into<PathBuf>, budget: u64) -> MetaResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let mut existing = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let path = entry.path();
                if meta.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let modified = meta.modified().ok();
                    existing.push((modified, path, meta.len()));
                } else {
                    // Leftover temporary file of an interrupted write.
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }
        existing.sort();

        let mut index = DiskIndex::default();
        for (_, path, size) in existing {
            index.record(path, size);
        }
        let victims = index.evict_to(budget);
        let bytes = index.bytes;

        let tier = DiskTier {
            root,
            budget,
            index: Mutex::new(index),
        };
        tier.delete_files(victims).await;

        info!(root = %tier.root.display(), bytes, budget, "Disk tier opened");
        Ok(tier)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes currently accounted to the tier.
    pub fn bytes(&self) -> u64 {
        self.index.lock().bytes
    }

    /// Reads one record. Unreadable or mismatched files are deleted and
    /// reported as a miss.
    pub async fn get(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) -> MetaResult<Option<MetadataRecord>> {
        let path = self.record_path(env, version, kind, key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.index.lock().forget(&path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<DiskEntry>(&bytes) {
            Ok(entry) if entry.kind == kind && entry.key == key => Ok(Some(entry.record)),
            Ok(_) | Err(_) => {
                warn!(path = %path.display(), "Discarding corrupt disk tier entry");
                self.index.lock().forget(&path);
                self.delete_files(vec![path]).await;
                Ok(None)
            }
        }
    }

    /// Writes one record. Returns false when the record alone exceeds the budget.
    pub async fn put(
        &self,
        env: &Environment,
        version: &StoredVersion,
        record: &MetadataRecord,
    ) -> MetaResult<bool> {
        let kind = record.kind();
        let key = record.key();
        let path = self.record_path(env, version, kind, &key);

        let payload = serde_json::to_vec(&DiskEntry {
            kind,
            key,
            record: record.clone(),
        })?;
        let size = payload.len() as u64;
        if size > self.budget {
            debug!(path = %path.display(), size, "Record larger than disk budget, not stored");
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let victims = {
            let mut index = self.index.lock();
            index.record(path, size);
            index.evict_to(self.budget)
        };
        if !victims.is_empty() {
            debug!(evicted = victims.len(), "Disk tier over budget, evicting oldest");
        }
        self.delete_files(victims).await;

        Ok(true)
    }

    pub async fn remove(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) {
        let path = self.record_path(env, version, kind, key);
        self.index.lock().forget(&path);
        self.delete_files(vec![path]).await;
    }

    /// Deletes everything cached for one environment.
    pub async fn invalidate_environment(&self, env: &Environment) -> MetaResult<usize> {
        let dir = self.root.join(short_hash(&env.base_url));
        let dropped = self.index.lock().forget_under(&dir);

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(environment_id = env.id, dropped, "Disk tier invalidated");
        Ok(dropped)
    }

    fn record_path(
        &self,
        env: &Environment,
        version: &StoredVersion,
        kind: RecordKind,
        key: &str,
    ) -> PathBuf {
        self.root
            .join(short_hash(&env.base_url))
            .join(short_hash(&version.version.fingerprint()))
            .join(kind.as_str())
            .join(format!("{}.json", hash(key)))
    }

    async fn delete_files(&self, paths: Vec<PathBuf>) {
        for path in paths {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to delete disk tier file");
                }
            }
        }
    }
}

fn hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn short_hash(value: &str) -> String {
    let mut h = hash(value);
    h.truncate(16);
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use metacache_core::{DataEntityRecord, LabelRecord, RecordHeader};

    fn env(id: i64, url: &str) -> Environment {
        Environment {
            id,
            base_url: url.to_string(),
            current_version_id: Some(1),
            created_at: Utc::now(),
            last_sync_at: None,
        }
    }

    fn stored_version(app: &str) -> StoredVersion {
        StoredVersion {
            id: 1,
            environment_id: 1,
            version: crate::testing::version(app),
            first_seen_at: Utc::now(),
        }
    }

    fn entity(name: &str) -> MetadataRecord {
        MetadataRecord::DataEntity(DataEntityRecord {
            header: RecordHeader::named(name),
        })
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_per_version() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        let e = env(1, "https://a.example.com");
        let v1 = stored_version("1");
        let v2 = stored_version("2");

        assert!(tier.put(&e, &v1, &entity("CustomersV3")).await.unwrap());
        let hit = tier.get(&e, &v1, RecordKind::DataEntity, "CustomersV3").await.unwrap();
        assert_eq!(hit, Some(entity("CustomersV3")));

        assert!(tier.get(&e, &v2, RecordKind::DataEntity, "CustomersV3").await.unwrap().is_none());
        assert!(tier.get(&e, &v1, RecordKind::Action, "CustomersV3").await.unwrap().is_none());
        assert!(tier.bytes() > 0);

        let label = MetadataRecord::Label(LabelRecord {
            label_id: "@SYS1".into(),
            language: "en-US".into(),
            text: "Customer".into(),
        });
        tier.put(&e, &v1, &label).await.unwrap();
        assert_eq!(
            tier.get(&e, &v1, RecordKind::Label, "en-US/@SYS1").await.unwrap(),
            Some(label)
        );
    }

    #[tokio::test]
    async fn test_budget_evicts_oldest_write_first() {
        let dir = tempfile::tempdir().unwrap();
        let e = env(1, "https://a.example.com");
        let v = stored_version("1");

        // Size one entry, then allow room for three.
        let probe = serde_json::to_vec(&DiskEntry {
            kind: RecordKind::DataEntity,
            key: "E0".into(),
            record: entity("E0"),
        })
        .unwrap()
        .len() as u64;
        let tier = DiskTier::open(dir.path(), probe * 3 + probe / 2).await.unwrap();

        for name in ["E0", "E1", "E2", "E3"] {
            tier.put(&e, &v, &entity(name)).await.unwrap();
        }

        assert!(tier.get(&e, &v, RecordKind::DataEntity, "E0").await.unwrap().is_none());
        for name in ["E1", "E2", "E3"] {
            assert!(tier.get(&e, &v, RecordKind::DataEntity, name).await.unwrap().is_some());
        }
        assert!(tier.bytes() <= probe * 3 + probe / 2);
    }

    #[tokio::test]
    async fn test_record_larger_than_budget_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 8).await.unwrap();
        let e = env(1, "https://a.example.com");
        let v = stored_version("1");

        assert!(!tier.put(&e, &v, &entity("CustomersV3")).await.unwrap());
        assert_eq!(tier.bytes(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_miss_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        let e = env(1, "https://a.example.com");
        let v = stored_version("1");

        tier.put(&e, &v, &entity("CustomersV3")).await.unwrap();
        let path = tier.record_path(&e, &v, RecordKind::DataEntity, "CustomersV3");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(tier.get(&e, &v, RecordKind::DataEntity, "CustomersV3").await.unwrap().is_none());
        assert!(!path.exists());
        assert_eq!(tier.bytes(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_environment_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = env(1, "https://a.example.com");
        let b = env(2, "https://b.example.com");
        let v = stored_version("1");

        {
            let tier = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
            tier.put(&a, &v, &entity("A")).await.unwrap();
            tier.put(&b, &v, &entity("B")).await.unwrap();
            assert_eq!(tier.invalidate_environment(&a).await.unwrap(), 1);
            assert!(tier.get(&a, &v, RecordKind::DataEntity, "A").await.unwrap().is_none());
        }

        let reopened = DiskTier::open(dir.path(), 1 << 20).await.unwrap();
        assert!(reopened.bytes() > 0);
        assert!(reopened.get(&b, &v, RecordKind::DataEntity, "B").await.unwrap().is_some());
    }
}

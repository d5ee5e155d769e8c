//! # Label Resolver
//!
//! Turns label identifiers into display text without one round trip per label.
//!
//! ```text
//! resolve_batch(keys)
//!   dedup ──► in-process label cache ──► labels table ──► ONE upstream batch
//!                    ▲                        ▲                  │
//!                    └──────── fill ──────────┴──── write-once ◄─┘
//! ```
//!
//! A failed upstream batch is not an error: everything already known is
//! returned and the rest is reported as unresolved, so display code can
//! fall back to the raw identifier.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;
use tracing::{debug, warn};

use crate::error::MetaResult;
use crate::upstream::MetadataSource;
use metacache_core::{EnvironmentId, LabelKey, LabelRecord, VersionId};
use metacache_db::Database;

type CacheKey = (EnvironmentId, VersionId, LabelKey);

/// Result of a batch resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelResolution {
    pub resolved: HashMap<LabelKey, String>,
    /// Keys neither cached nor returned by upstream, sorted.
    pub unresolved: Vec<LabelKey>,
    /// Set when the upstream batch call failed.
    pub upstream_error: Option<String>,
}

impl LabelResolution {
    /// Resolved text, or the raw label id when unresolved.
    pub fn text_or_id<'a>(&'a self, key: &'a LabelKey) -> &'a str {
        self.resolved
            .get(key)
            .map(String::as_str)
            .unwrap_or(&key.label_id)
    }
}

pub struct LabelResolver {
    db: Database,
    cache: Cache<CacheKey, String>,
    upstream_calls: AtomicU64,
}

impl LabelResolver {
    pub fn new(db: Database, capacity: u64) -> Self {
        LabelResolver {
            db,
            cache: Cache::builder().max_capacity(capacity).build(),
            upstream_calls: AtomicU64::new(0),
        }
    }

    /// Resolves every key, issuing at most one upstream call for the
    /// keys not already known.
    pub async fn resolve_batch(
        &self,
        environment_id: EnvironmentId,
        version_id: VersionId,
        keys: &[LabelKey],
        source: &dyn MetadataSource,
    ) -> MetaResult<LabelResolution> {
        let requested: BTreeSet<&LabelKey> = keys.iter().collect();
        let mut resolution = LabelResolution::default();

        let mut uncached = Vec::new();
        for key in requested {
            match self.cache.get(&(environment_id, version_id, key.clone())) {
                Some(text) => {
                    resolution.resolved.insert(key.clone(), text);
                }
                None => uncached.push(key.clone()),
            }
        }

        if !uncached.is_empty() {
            let stored = self
                .db
                .labels()
                .get_many(environment_id, version_id, &uncached)
                .await?;
            for (key, text) in stored {
                self.cache
                    .insert((environment_id, version_id, key.clone()), text.clone());
                resolution.resolved.insert(key, text);
            }
        }

        let missing: Vec<LabelKey> = uncached
            .into_iter()
            .filter(|k| !resolution.resolved.contains_key(k))
            .collect();
        if missing.is_empty() {
            return Ok(resolution);
        }

        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        let fetched = match source.fetch_labels_batch(&missing).await {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(
                    environment_id,
                    missing = missing.len(),
                    error = %err,
                    "Label batch fetch failed, returning cached labels only"
                );
                resolution.unresolved = missing;
                resolution.upstream_error = Some(err.to_string());
                return Ok(resolution);
            }
        };

        let mut records = Vec::with_capacity(fetched.len());
        for key in missing {
            match fetched.get(&key) {
                Some(text) => records.push(LabelRecord {
                    label_id: key.label_id.clone(),
                    language: key.language.clone(),
                    text: text.clone(),
                }),
                None => resolution.unresolved.push(key),
            }
        }

        let inserted = self
            .db
            .labels()
            .put_many(environment_id, version_id, &records)
            .await?;
        debug!(
            environment_id,
            fetched = records.len(),
            inserted,
            unresolved = resolution.unresolved.len(),
            "Label batch resolved"
        );

        for record in records {
            let key = record.key();
            self.cache
                .insert((environment_id, version_id, key.clone()), record.text.clone());
            resolution.resolved.insert(key, record.text);
        }

        Ok(resolution)
    }

    /// Drops cached labels of one environment.
    pub fn invalidate(&self, environment_id: EnvironmentId) {
        let doomed: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.0 == environment_id)
            .map(|(key, _)| CacheKey::clone(&key))
            .collect();
        for key in &doomed {
            self.cache.invalidate(key);
        }
    }

    /// Upstream batch calls issued so far.
    pub fn upstream_calls(&self) -> u64 {
        self.upstream_calls.load(Ordering::Relaxed)
    }
}

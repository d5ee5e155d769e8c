//! # Metadata Service
//!
//! The facade the tool/resource layer talks to. Owns every component and
//! wires them per environment.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          MetadataService                                │
//! │                                                                         │
//! │   get ─────────► VersionResolver ──► TieredStore ──► Lookup            │
//! │                                          │ stale/never synced           │
//! │                                          └──► start_or_join (background)│
//! │                                                                         │
//! │   search ──────► SearchIndex (current version)                         │
//! │   find ────────► LIKE pattern ──► empty? ──► salient terms ──► search   │
//! │                                                                         │
//! │   start_sync / get_sync_progress / cancel_sync / list_sessions /       │
//! │   get_sync_history ──────────────► SyncOrchestrator                    │
//! │                                                                         │
//! │   get_statistics ──► record counts, labels, index size, tier counters  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads never wait for a sync. A read that a sync would change returns
//! `NotFound` right away, optionally after kicking off a background session.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::MemoryTier;
use crate::config::MetacacheConfig;
use crate::disk::DiskTier;
use crate::error::{MetaError, MetaResult};
use crate::labels::{LabelResolution, LabelResolver};
use crate::orchestrator::SyncOrchestrator;
use crate::store::{CacheCounters, InvalidationReport, Lookup, MissReason, TieredStore};
use crate::upstream::MetadataSource;
use crate::version::VersionResolver;
use metacache_core::lexical::{pattern_to_like, salient_terms};
use metacache_core::{
    Environment, EnvironmentId, LabelKey, MetadataRecord, MetadataVersion, RecordKind, SearchHit,
    SessionId, StoredVersion, SyncMode, SyncScope, SyncSession,
};
use metacache_db::Database;

/// Result of a pattern lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FindResult {
    pub records: Vec<MetadataRecord>,
    /// The pattern matched nothing and the records came from lexical search.
    pub via_fallback: bool,
}

/// Snapshot of one environment's cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub environment_id: EnvironmentId,
    pub version_id: Option<i64>,
    pub version: Option<MetadataVersion>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub records_by_kind: BTreeMap<RecordKind, u64>,
    pub labels: u64,
    pub index_size: u64,
    pub sessions: u64,
    pub active_sessions: usize,
    pub cache: CacheCounters,
    pub memory_entries: u64,
    pub disk_bytes: u64,
}

pub struct MetadataService {
    config: MetacacheConfig,
    db: Database,
    store: Arc<TieredStore>,
    versions: Arc<VersionResolver>,
    labels: Arc<LabelResolver>,
    orchestrator: SyncOrchestrator,
    sources: RwLock<HashMap<EnvironmentId, Arc<dyn MetadataSource>>>,
}

impl MetadataService {
    /// Opens the relational tier (running migrations) and the fast tiers.
    pub async fn open(config: MetacacheConfig) -> MetaResult<Self> {
        config.validate()?;

        let db = Database::new(config.database.to_db_config()).await?;
        db.sessions().fail_abandoned().await?;

        let disk = if config.cache.disk_enabled {
            Some(DiskTier::open(&config.cache.disk_dir, config.cache.disk_budget_bytes).await?)
        } else {
            None
        };

        let store = Arc::new(TieredStore::new(
            db.clone(),
            MemoryTier::new(config.cache.memory_capacity),
            disk,
        ));
        let versions = Arc::new(VersionResolver::new(
            db.clone(),
            config.version.ttl(),
            config.version.retained_versions,
        ));
        let labels = Arc::new(LabelResolver::new(db.clone(), config.labels.memory_capacity));
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            Arc::clone(&store),
            Arc::clone(&versions),
            Arc::clone(&labels),
            config.sync.clone(),
            config.labels.clone(),
        );

        info!(
            disk_tier = config.cache.disk_enabled,
            memory_capacity = config.cache.memory_capacity,
            "Metadata service ready"
        );

        Ok(MetadataService {
            config,
            db,
            store,
            versions,
            labels,
            orchestrator,
            sources: RwLock::new(HashMap::new()),
        })
    }

    // =========================================================================
    // Environments
    // =========================================================================

    /// Registers (or re-attaches) an environment and the source serving it.
    pub async fn register_environment(
        &self,
        base_url: &str,
        source: Arc<dyn MetadataSource>,
    ) -> MetaResult<Environment> {
        url::Url::parse(base_url)?;
        let env = self.db.environments().get_or_create(base_url).await?;
        self.sources.write().insert(env.id, source);
        info!(environment_id = env.id, base_url = %env.base_url, "Environment registered");
        Ok(env)
    }

    pub async fn environments(&self) -> MetaResult<Vec<Environment>> {
        Ok(self.db.environments().list().await?)
    }

    async fn environment(&self, environment_id: EnvironmentId) -> MetaResult<Environment> {
        self.db
            .environments()
            .get(environment_id)
            .await?
            .ok_or_else(|| MetaError::EnvironmentNotFound(environment_id.to_string()))
    }

    fn source(&self, environment_id: EnvironmentId) -> MetaResult<Arc<dyn MetadataSource>> {
        self.sources
            .read()
            .get(&environment_id)
            .cloned()
            .ok_or_else(|| MetaError::EnvironmentNotFound(environment_id.to_string()))
    }

    /// Resolves the current version, reloading the environment if it moved.
    ///
    /// `None` when upstream is unreachable and no version was ever known.
    async fn current(
        &self,
        env: Environment,
        source: &dyn MetadataSource,
    ) -> MetaResult<Option<(Environment, StoredVersion)>> {
        let resolution = match self.versions.resolve(&env, source).await {
            Ok(resolution) => resolution,
            Err(MetaError::UpstreamUnavailable(e) | MetaError::UpstreamRejected(e)) => {
                debug!(environment_id = env.id, error = %e, "No version known yet");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !resolution.changed {
            return Ok(Some((env, resolution.version)));
        }

        self.store.invalidate_fast(&env).await?;
        self.labels.invalidate(env.id);
        let env = self.environment(env.id).await?;
        Ok(Some((env, resolution.version)))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Looks a record up for the environment's current version.
    pub async fn get(
        &self,
        environment_id: EnvironmentId,
        kind: RecordKind,
        key: &str,
    ) -> MetaResult<Lookup> {
        let env = self.environment(environment_id).await?;
        let source = self.source(environment_id)?;

        let Some((env, version)) = self.current(env, source.as_ref()).await? else {
            return Ok(Lookup::NotFound {
                reason: MissReason::NeverSynced,
            });
        };

        let lookup = self.store.get(&env, &version, kind, key).await?;

        if lookup.needs_sync() && self.config.sync.auto_sync_on_stale {
            match self
                .orchestrator
                .start_or_join(env, source, SyncMode::Incremental, SyncScope::All)
            {
                Ok(session_id) => {
                    debug!(environment_id, %kind, key, %session_id, "Background sync requested")
                }
                Err(e) => warn!(environment_id, error = %e, "Could not request background sync"),
            }
        }

        Ok(lookup)
    }

    /// Free-text search over the current version.
    pub async fn search(
        &self,
        environment_id: EnvironmentId,
        text: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> MetaResult<Vec<SearchHit>> {
        let env = self.environment(environment_id).await?;
        let source = self.source(environment_id)?;
        let Some((env, version)) = self.current(env, source.as_ref()).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .db
            .search()
            .search(env.id, version.id, text, kind, limit)
            .await?)
    }

    /// Pattern lookup (`Cust*`, `^Sales.*V2$`, `Vend?`), falling back to
    /// lexical search on the pattern's salient terms when it matches nothing.
    pub async fn find(
        &self,
        environment_id: EnvironmentId,
        pattern: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> MetaResult<FindResult> {
        let env = self.environment(environment_id).await?;
        let source = self.source(environment_id)?;
        let Some((env, version)) = self.current(env, source.as_ref()).await? else {
            return Ok(FindResult {
                records: Vec::new(),
                via_fallback: false,
            });
        };

        let like = pattern_to_like(pattern);
        let matched = self
            .db
            .records()
            .find_like(env.id, version.id, &like, kind, limit)
            .await?;
        if !matched.is_empty() {
            return Ok(FindResult {
                records: matched.into_iter().map(|r| r.record).collect(),
                via_fallback: false,
            });
        }

        let terms = salient_terms(pattern);
        if terms.is_empty() {
            return Ok(FindResult {
                records: Vec::new(),
                via_fallback: false,
            });
        }

        let search = self.db.search();
        let mut hits = search
            .search(env.id, version.id, &terms.join(" "), kind, limit)
            .await?;
        if hits.is_empty() && terms.len() > 1 {
            for term in &terms {
                hits = search.search(env.id, version.id, term, kind, limit).await?;
                if !hits.is_empty() {
                    break;
                }
            }
        }
        debug!(environment_id, pattern, terms = ?terms, hits = hits.len(), "Pattern fell back to lexical search");

        let mut records = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(stored) = self
                .db
                .records()
                .get(env.id, version.id, hit.kind, &hit.name)
                .await?
            {
                records.push(stored.record);
            }
        }

        Ok(FindResult {
            records,
            via_fallback: true,
        })
    }

    /// Resolves label text for the current version.
    pub async fn resolve_labels(
        &self,
        environment_id: EnvironmentId,
        keys: &[LabelKey],
    ) -> MetaResult<LabelResolution> {
        let env = self.environment(environment_id).await?;
        let source = self.source(environment_id)?;
        let Some((env, version)) = self.current(env, source.as_ref()).await? else {
            let mut unresolved = keys.to_vec();
            unresolved.sort();
            unresolved.dedup();
            return Ok(LabelResolution {
                unresolved,
                upstream_error: Some("no metadata version known".to_string()),
                ..Default::default()
            });
        };
        self.labels
            .resolve_batch(env.id, version.id, keys, source.as_ref())
            .await
    }

    // =========================================================================
    // Sync Sessions
    // =========================================================================

    /// Starts a sync session; see [`SyncOrchestrator::start`].
    pub async fn start_sync(
        &self,
        environment_id: EnvironmentId,
        mode: SyncMode,
        scope: SyncScope,
    ) -> MetaResult<SessionId> {
        let env = self.environment(environment_id).await?;
        let source = self.source(environment_id)?;
        self.orchestrator.start(env, source, mode, scope)
    }

    pub async fn get_sync_progress(&self, session_id: SessionId) -> MetaResult<SyncSession> {
        self.orchestrator.get_progress(session_id).await
    }

    pub async fn cancel_sync(&self, session_id: SessionId) -> MetaResult<bool> {
        self.orchestrator.cancel(session_id).await
    }

    /// Sessions currently pending or running, across environments.
    pub fn list_sessions(&self) -> Vec<SyncSession> {
        self.orchestrator.list_active()
    }

    pub async fn get_sync_history(
        &self,
        environment_id: EnvironmentId,
        limit: usize,
    ) -> MetaResult<Vec<SyncSession>> {
        self.orchestrator.history(environment_id, limit).await
    }

    pub async fn wait_for_sync(&self, session_id: SessionId) -> MetaResult<SyncSession> {
        self.orchestrator.wait(session_id).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Counts for the environment's current version plus tier counters.
    ///
    /// Reads only local state; never calls upstream.
    pub async fn get_statistics(&self, environment_id: EnvironmentId) -> MetaResult<Statistics> {
        let env = self.environment(environment_id).await?;

        let version = match env.current_version_id {
            Some(id) => self.db.versions().get(id).await?,
            None => None,
        };

        let (records_by_kind, labels, index_size) = match &version {
            Some(v) => (
                self.db.records().count_by_kind(env.id, v.id).await?,
                self.db.labels().count(env.id, v.id).await?,
                self.db.search().size(env.id, v.id).await?,
            ),
            None => (BTreeMap::new(), 0, 0),
        };

        let active_sessions = self
            .orchestrator
            .list_active()
            .iter()
            .filter(|s| s.environment_id == env.id)
            .count();

        Ok(Statistics {
            environment_id: env.id,
            version_id: version.as_ref().map(|v| v.id),
            version: version.map(|v| v.version),
            last_sync_at: env.last_sync_at,
            records_by_kind,
            labels,
            index_size,
            sessions: self.db.sessions().count(env.id).await?,
            active_sessions,
            cache: self.store.counters(),
            memory_entries: self.store.memory_entries(),
            disk_bytes: self.store.disk_bytes(),
        })
    }

    pub async fn list_versions(&self, environment_id: EnvironmentId) -> MetaResult<Vec<StoredVersion>> {
        Ok(self.db.versions().list(environment_id).await?)
    }

    /// Drops the environment's fast tiers and its cached version, so the
    /// next read re-checks upstream; with `retain`, also prunes relational
    /// rows of versions beyond the newest `retain`.
    pub async fn invalidate(
        &self,
        environment_id: EnvironmentId,
        retain: Option<usize>,
    ) -> MetaResult<InvalidationReport> {
        let env = self.environment(environment_id).await?;
        self.versions.forget(env.id);
        self.labels.invalidate(env.id);
        self.store.invalidate(&env, retain).await
    }

    /// Rebuilds the lexical index from the relational tier.
    pub async fn rebuild_index(&self) -> MetaResult<u64> {
        Ok(self.db.search().rebuild().await?)
    }

    /// Cancels running sessions and closes the relational tier.
    pub async fn shutdown(&self) {
        info!("Shutting down metadata service");
        self.orchestrator.shutdown().await;
        self.db.close().await;
    }
}

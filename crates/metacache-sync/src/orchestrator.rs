//! # Sync Orchestrator
//!
//! Runs sync sessions: paginated population of the relational tier from the
//! upstream metadata endpoints, with progress, cancellation and history.
//!
//! ## Session State Machine
//! ```text
//!                 start()
//!                    │
//!                    ▼
//!              ┌──────────┐      ┌──────────┐
//!              │ PENDING  │─────►│ RUNNING  │
//!              └──────────┘      └────┬─────┘
//!                                     │
//!              ┌──────────────────────┼──────────────────────┐
//!              ▼                      ▼                      ▼
//!        ┌───────────┐          ┌──────────┐          ┌───────────┐
//!        │ COMPLETED │          │  FAILED  │          │ CANCELLED │
//!        └───────────┘          └──────────┘          └───────────┘
//! ```
//!
//! ## One Session
//! ```text
//! resolve version ──► (changed? drop fast tiers)
//!       │
//!       ▼
//! for kind in [data_entity, action, enumeration] ∩ scope:
//!     loop:
//!         cancelled? ──► CANCELLED          (checked between pages only)
//!         fetch page ──► retry retryable errors with exponential backoff
//!         decode ──► filter unmodified (incremental)
//!         apply under the environment write lock
//!         update + persist progress
//!       │
//!       ▼
//! labels phase: referenced label ids ──► LabelResolver (batched)
//!       │                               ──► label text written onto records
//!       ▼
//! full sync? delete rows this session did not touch (removals)
//!       │
//!       ▼
//! mark environment synced (scope = all) ──► COMPLETED
//! ```
//!
//! Pages are applied as they arrive. A cancelled or failed session keeps every
//! page it finished; a page is never half applied.
//!
//! Only one session runs per (environment, record kind). A session reserves
//! every kind its scope covers; a `start` overlapping any reserved kind gets
//! [`MetaError::SyncAlreadyInProgress`] carrying the running session's id.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LabelSettings, SyncSettings};
use crate::error::{MetaError, MetaResult};
use crate::labels::LabelResolver;
use crate::store::TieredStore;
use crate::upstream::{decode_page, MetadataSource, PageRequest, RawPage, UpstreamError};
use crate::version::VersionResolver;
use metacache_core::{
    CoreError, Environment, EnvironmentId, LabelKey, RecordKind, SessionId, StoredVersion, SyncMode,
    SyncScope, SyncSession, SyncState,
};
use metacache_db::{Database, DbError};

// =============================================================================
// Session Handle
// =============================================================================

/// Live state of a running session, shared between its task and callers.
struct SessionHandle {
    session: RwLock<SyncSession>,
    cancel: CancellationToken,
    state_tx: watch::Sender<SyncState>,
}

impl SessionHandle {
    fn snapshot(&self) -> SyncSession {
        self.session.read().clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut SyncSession) -> T) -> T {
        f(&mut self.session.write())
    }
}

/// Why a session stopped before completing.
enum Interrupt {
    Cancelled,
    Failed(MetaError),
}

impl From<MetaError> for Interrupt {
    fn from(err: MetaError) -> Self {
        Interrupt::Failed(err)
    }
}

impl From<DbError> for Interrupt {
    fn from(err: DbError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<UpstreamError> for Interrupt {
    fn from(err: UpstreamError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<CoreError> for Interrupt {
    fn from(err: CoreError) -> Self {
        Interrupt::Failed(err.into())
    }
}

type RunResult<T> = Result<T, Interrupt>;

// =============================================================================
// Orchestrator
// =============================================================================

/// Cheap to clone; clones share the session registry.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    db: Database,
    store: Arc<TieredStore>,
    versions: Arc<VersionResolver>,
    labels: Arc<LabelResolver>,
    sync: SyncSettings,
    label_settings: LabelSettings,
    /// (environment, kind) -> running session
    registry: Mutex<HashMap<(EnvironmentId, RecordKind), SessionId>>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionHandle>>>,
    /// Serializes relational writes per environment across scopes.
    write_locks: Mutex<HashMap<EnvironmentId, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        db: Database,
        store: Arc<TieredStore>,
        versions: Arc<VersionResolver>,
        labels: Arc<LabelResolver>,
        sync: SyncSettings,
        label_settings: LabelSettings,
    ) -> Self {
        SyncOrchestrator {
            inner: Arc::new(Inner {
                db,
                store,
                versions,
                labels,
                sync,
                label_settings,
                registry: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                write_locks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Starts a session in the background and returns its id.
    ///
    /// Fails with [`MetaError::SyncAlreadyInProgress`] when a running session
    /// of the same environment holds any kind the scope covers.
    pub fn start(
        &self,
        env: Environment,
        source: Arc<dyn MetadataSource>,
        mode: SyncMode,
        scope: SyncScope,
    ) -> MetaResult<SessionId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MetaError::ShuttingDown);
        }

        let session = SyncSession::new(env.id, mode, scope);
        let id = session.id;
        let (state_tx, _) = watch::channel(session.state);
        let handle = Arc::new(SessionHandle {
            session: RwLock::new(session),
            cancel: self.inner.shutdown.child_token(),
            state_tx,
        });

        {
            let mut registry = self.inner.registry.lock();
            let kinds = reserved_kinds(scope);
            if let Some(existing) = kinds.iter().find_map(|kind| registry.get(&(env.id, *kind))) {
                debug!(environment_id = env.id, %scope, session_id = %existing, "Sync already running");
                return Err(MetaError::SyncAlreadyInProgress {
                    session_id: *existing,
                });
            }
            for kind in kinds {
                registry.insert((env.id, kind), id);
            }
            self.inner.sessions.lock().insert(id, Arc::clone(&handle));
        }

        info!(
            session_id = %id,
            environment_id = env.id,
            %mode,
            %scope,
            "Sync session started"
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.execute(&handle, &env, source.as_ref()).await;
            inner.finish(&handle, outcome).await;
        });

        Ok(id)
    }

    /// Like [`SyncOrchestrator::start`], but returns the running session's id
    /// instead of failing when one exists.
    pub fn start_or_join(
        &self,
        env: Environment,
        source: Arc<dyn MetadataSource>,
        mode: SyncMode,
        scope: SyncScope,
    ) -> MetaResult<SessionId> {
        match self.start(env, source, mode, scope) {
            Err(MetaError::SyncAlreadyInProgress { session_id }) => Ok(session_id),
            other => other,
        }
    }

    /// Current state of a session, live or historical.
    pub async fn get_progress(&self, id: SessionId) -> MetaResult<SyncSession> {
        if let Some(handle) = self.handle(id) {
            return Ok(handle.snapshot());
        }
        self.inner
            .db
            .sessions()
            .get(id)
            .await?
            .ok_or(MetaError::SessionNotFound(id))
    }

    /// Requests cooperative cancellation. Returns false if the session
    /// already finished.
    pub async fn cancel(&self, id: SessionId) -> MetaResult<bool> {
        if let Some(handle) = self.handle(id) {
            info!(session_id = %id, "Sync cancellation requested");
            handle.cancel.cancel();
            return Ok(true);
        }
        match self.inner.db.sessions().get(id).await? {
            Some(_) => Ok(false),
            None => Err(MetaError::SessionNotFound(id)),
        }
    }

    /// Sessions that have not reached a terminal state, oldest first.
    pub fn list_active(&self) -> Vec<SyncSession> {
        let mut active: Vec<SyncSession> = self
            .inner
            .sessions
            .lock()
            .values()
            .map(|h| h.snapshot())
            .collect();
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Persisted sessions of an environment, newest first.
    pub async fn history(
        &self,
        environment_id: EnvironmentId,
        limit: usize,
    ) -> MetaResult<Vec<SyncSession>> {
        Ok(self.inner.db.sessions().history(environment_id, limit).await?)
    }

    /// Waits for a session to reach a terminal state.
    pub async fn wait(&self, id: SessionId) -> MetaResult<SyncSession> {
        let Some(handle) = self.handle(id) else {
            return self.get_progress(id).await;
        };
        let mut rx = handle.state_tx.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| MetaError::Internal(format!("session {id} dropped its state channel")))?;
        Ok(handle.snapshot())
    }

    /// Cancels every running session and waits for them to stop.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles: Vec<Arc<SessionHandle>> =
            self.inner.sessions.lock().values().cloned().collect();
        info!(active = handles.len(), "Stopping sync sessions");
        for handle in handles {
            let mut rx = handle.state_tx.subscribe();
            let _ = rx.wait_for(|state| state.is_terminal()).await;
        }
    }

    fn handle(&self, id: SessionId) -> Option<Arc<SessionHandle>> {
        self.inner.sessions.lock().get(&id).cloned()
    }
}

/// Kinds a session of `scope` holds in the registry. A label-only session
/// holds the label kind; every other scope holds its relational kinds.
fn reserved_kinds(scope: SyncScope) -> Vec<RecordKind> {
    match scope.kinds() {
        kinds if kinds.is_empty() => vec![RecordKind::Label],
        kinds => kinds,
    }
}

// =============================================================================
// Session Execution
// =============================================================================

impl Inner {
    async fn execute(
        &self,
        handle: &SessionHandle,
        env: &Environment,
        source: &dyn MetadataSource,
    ) -> RunResult<()> {
        handle.update(|s| s.transition(SyncState::Running))?;
        self.persist(handle).await?;

        let resolution = self.versions.resolve(env, source).await?;
        if resolution.changed {
            self.store.invalidate_fast(env).await?;
            self.labels.invalidate(env.id);
        }
        let version = resolution.version;

        let env = self
            .db
            .environments()
            .get(env.id)
            .await?
            .ok_or_else(|| MetaError::EnvironmentNotFound(env.base_url.clone()))?;

        let (requested, scope, started_at, tag) = {
            let s = handle.session.read();
            (s.mode, s.scope, s.started_at, s.id.to_string())
        };
        let mode = if requested == SyncMode::Incremental
            && (!env.has_synced() || self.db.records().count(env.id, version.id).await? == 0)
        {
            info!(session_id = %tag, "No synced data for this version, running a full sync");
            SyncMode::Full
        } else {
            requested
        };
        handle.update(|s| {
            s.mode = mode;
            s.version_id = Some(version.id);
        });
        self.persist(handle).await?;

        let modified_since = match mode {
            SyncMode::Incremental => env.last_sync_at,
            SyncMode::Full => None,
        };

        let mut referenced = BTreeSet::new();
        for kind in scope.kinds() {
            self.sync_kind(handle, &env, &version, source, kind, modified_since, &tag, &mut referenced)
                .await?;
        }

        self.sync_labels(handle, &env, &version, source, referenced).await?;

        if handle.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        if mode == SyncMode::Full {
            self.detect_removals(handle, &env, &version, scope, &tag, started_at).await?;
        }

        if scope == SyncScope::All {
            self.db.environments().mark_synced(env.id, started_at).await?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_kind(
        &self,
        handle: &SessionHandle,
        env: &Environment,
        version: &StoredVersion,
        source: &dyn MetadataSource,
        kind: RecordKind,
        modified_since: Option<DateTime<Utc>>,
        tag: &str,
        referenced: &mut BTreeSet<String>,
    ) -> RunResult<()> {
        let mut continuation = None;

        loop {
            if handle.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let request = PageRequest {
                continuation: continuation.take(),
                modified_since,
            };
            let page = self.fetch_with_retry(handle, source, kind, &request).await?;

            let mut records = decode_page(kind, &page)?;
            let fetched = records.len() as u64;
            if let Some(since) = modified_since {
                records.retain(|r| {
                    r.header()
                        .and_then(|h| h.modified_at)
                        .map_or(true, |modified| modified > since)
                });
            }
            let skipped = fetched - records.len() as u64;

            for record in &records {
                referenced.extend(record.referenced_labels().into_iter().map(str::to_string));
            }

            {
                let lock = self.write_lock(env.id);
                let _guard = lock.lock().await;
                self.store
                    .put_batch(env, version, &records, Some(tag), self.sync.write_granularity)
                    .await?;
            }

            let progress = handle.update(|s| {
                let p = s.progress.kind_mut(kind);
                p.processed += records.len() as u64;
                p.skipped += skipped;
                p.pages += 1;
                if page.total.is_some() {
                    p.total = page.total;
                }
                *p
            });
            self.persist(handle).await?;

            debug!(
                session_id = %tag,
                %kind,
                page = progress.pages,
                processed = progress.processed,
                skipped = progress.skipped,
                total = ?progress.total,
                "Page applied"
            );

            match page.next {
                Some(next) => continuation = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Fetches one page, retrying retryable errors with exponential backoff.
    async fn fetch_with_retry(
        &self,
        handle: &SessionHandle,
        source: &dyn MetadataSource,
        kind: RecordKind,
        request: &PageRequest,
    ) -> RunResult<RawPage> {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.sync.initial_backoff(),
            max_interval: self.sync.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match source.fetch_metadata_page(kind, request).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.sync.max_page_attempts {
                warn!(%kind, attempt, error = %err, "Page fetch failed");
                return Err(err.into());
            }

            let delay = match &err {
                UpstreamError::RateLimited {
                    retry_after_secs: Some(secs),
                } => Duration::from_secs(*secs),
                _ => backoff.next_backoff().unwrap_or_else(|| self.sync.max_backoff()),
            };
            warn!(%kind, attempt, error = %err, ?delay, "Page fetch failed, retrying");

            tokio::select! {
                _ = handle.cancel.cancelled() => return Err(Interrupt::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Resolves label text for the labels the session's records reference.
    async fn sync_labels(
        &self,
        handle: &SessionHandle,
        env: &Environment,
        version: &StoredVersion,
        source: &dyn MetadataSource,
        referenced: BTreeSet<String>,
    ) -> RunResult<()> {
        let mut ids: BTreeSet<String> = self
            .db
            .records()
            .label_ids_without_text(env.id, version.id)
            .await?
            .into_iter()
            .collect();
        ids.extend(referenced);
        if ids.is_empty() {
            return Ok(());
        }

        let language = &self.label_settings.language;
        let keys: Vec<LabelKey> = ids
            .into_iter()
            .map(|id| LabelKey::new(id, language.as_str()))
            .collect();
        let total = keys.len() as u64;
        let mut updated = 0;

        for chunk in keys.chunks(self.label_settings.batch_size.max(1)) {
            if handle.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            let resolution = self
                .labels
                .resolve_batch(env.id, version.id, chunk, source)
                .await?;
            if let Some(err) = &resolution.upstream_error {
                warn!(
                    environment_id = env.id,
                    unresolved = resolution.unresolved.len(),
                    error = %err,
                    "Labels left unresolved"
                );
            }

            {
                let lock = self.write_lock(env.id);
                let _guard = lock.lock().await;
                for (key, text) in &resolution.resolved {
                    updated += self
                        .db
                        .records()
                        .update_label_text(env.id, version.id, &key.label_id, text)
                        .await?;
                }
            }

            handle.update(|s| {
                let p = s.progress.kind_mut(RecordKind::Label);
                p.processed += resolution.resolved.len() as u64;
                p.skipped += resolution.unresolved.len() as u64;
                p.pages += 1;
                p.total = Some(total);
            });
            self.persist(handle).await?;
        }

        if updated > 0 {
            // Promoted copies were taken before their label text existed.
            self.store.invalidate_fast(env).await?;
        }
        debug!(environment_id = env.id, labels = total, records_updated = updated, "Label phase done");
        Ok(())
    }

    async fn detect_removals(
        &self,
        handle: &SessionHandle,
        env: &Environment,
        version: &StoredVersion,
        scope: SyncScope,
        tag: &str,
        started_at: DateTime<Utc>,
    ) -> RunResult<()> {
        let mut removed_any = false;
        for kind in scope.kinds() {
            let removed = {
                let lock = self.write_lock(env.id);
                let _guard = lock.lock().await;
                self.db
                    .records()
                    .delete_untouched(env.id, version.id, kind, tag, started_at)
                    .await?
            };
            if removed > 0 {
                info!(session_id = %tag, %kind, removed, "Removed records no longer upstream");
                removed_any = true;
            }
            handle.update(|s| s.progress.kind_mut(kind).removed = removed);
        }
        if removed_any {
            self.store.invalidate_fast(env).await?;
        }
        self.persist(handle).await?;
        Ok(())
    }

    /// Moves the session to its terminal state, persists it and frees its slot.
    async fn finish(&self, handle: &SessionHandle, outcome: RunResult<()>) {
        let transition = handle.update(|s| match outcome {
            Ok(()) => s.transition(SyncState::Completed),
            Err(Interrupt::Cancelled) => s.transition(SyncState::Cancelled),
            Err(Interrupt::Failed(err)) => {
                let processed = s.progress.processed();
                let detail = if processed > 0 {
                    MetaError::PartialSyncFailure {
                        processed,
                        detail: err.to_string(),
                    }
                    .to_string()
                } else {
                    err.to_string()
                };
                s.fail(detail)
            }
        });

        let session = handle.snapshot();
        match transition {
            Ok(()) => info!(
                session_id = %session.id,
                environment_id = session.environment_id,
                state = %session.state,
                processed = session.progress.processed(),
                error = ?session.error,
                "Sync session finished"
            ),
            Err(e) => error!(session_id = %session.id, error = %e, "Invalid session transition"),
        }

        if let Err(e) = self.db.sessions().save(&session).await {
            error!(session_id = %session.id, error = %e, "Failed to persist finished session");
        }
        if let Err(e) = self
            .db
            .sessions()
            .prune(session.environment_id, self.sync.history_limit)
            .await
        {
            warn!(error = %e, "Failed to prune session history");
        }

        {
            let mut registry = self.registry.lock();
            for kind in reserved_kinds(session.scope) {
                let key = (session.environment_id, kind);
                if registry.get(&key) == Some(&session.id) {
                    registry.remove(&key);
                }
            }
            self.sessions.lock().remove(&session.id);
        }

        handle.state_tx.send_replace(session.state);
    }

    async fn persist(&self, handle: &SessionHandle) -> MetaResult<()> {
        let session = handle.snapshot();
        self.db.sessions().save(&session).await?;
        Ok(())
    }

    fn write_lock(&self, environment_id: EnvironmentId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.write_locks.lock().entry(environment_id).or_default())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryTier;
    use crate::testing::{entity_json, enum_json, modified_entity_json, version, FakeSource};
    use metacache_db::DbConfig;

    struct Harness {
        db: Database,
        orchestrator: SyncOrchestrator,
        source: Arc<FakeSource>,
        env: Environment,
    }

    async fn harness_with(sync: SyncSettings) -> Harness {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let env = db.environments().get_or_create("https://erp.example.com").await.unwrap();
        let store = Arc::new(TieredStore::new(db.clone(), MemoryTier::new(1000), None));
        let versions = Arc::new(VersionResolver::new(db.clone(), Duration::from_secs(300), 2));
        let labels = Arc::new(LabelResolver::new(db.clone(), 1000));
        let orchestrator = SyncOrchestrator::new(
            db.clone(),
            store,
            versions,
            labels,
            sync,
            LabelSettings::default(),
        );
        Harness {
            db,
            orchestrator,
            source: Arc::new(FakeSource::new(version("10.0.1"))),
            env,
        }
    }

    fn fast_settings() -> SyncSettings {
        SyncSettings {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..SyncSettings::default()
        }
    }

    async fn harness() -> Harness {
        harness_with(fast_settings()).await
    }

    impl Harness {
        fn start(&self, mode: SyncMode, scope: SyncScope) -> MetaResult<SessionId> {
            self.orchestrator
                .start(self.env.clone(), self.source.clone(), mode, scope)
        }

        async fn run(&self, mode: SyncMode) -> SyncSession {
            let env = self.db.environments().get(self.env.id).await.unwrap().unwrap();
            let id = self
                .orchestrator
                .start(env, self.source.clone(), mode, SyncScope::All)
                .unwrap();
            self.orchestrator.wait(id).await.unwrap()
        }

        async fn names(&self, session: &SyncSession) -> Vec<String> {
            let version_id = session.version_id.unwrap();
            let mut names: Vec<String> = self
                .db
                .records()
                .find_like(self.env.id, version_id, "%", Some(RecordKind::DataEntity), 100)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.record.name().to_string())
                .collect();
            names.sort();
            names
        }
    }

    #[tokio::test]
    async fn test_full_sync_populates_records_and_labels() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![
                vec![entity_json("CustomersV3", Some("@SYS1")), entity_json("VendorsV2", None)],
                vec![entity_json("SalesOrderHeadersV2", Some("@SYS2"))],
            ],
        );
        h.source.set_pages(RecordKind::Enumeration, vec![vec![enum_json("NoYes", "@SYS10")]]);
        h.source.set_label("@SYS1", "en-US", "Customers");
        h.source.set_label("@SYS2", "en-US", "Sales order headers");
        h.source.set_label("@SYS10", "en-US", "No or yes");

        let session = h.run(SyncMode::Full).await;

        assert_eq!(session.state, SyncState::Completed);
        assert!(session.error.is_none());
        let entities = session.progress.kind(RecordKind::DataEntity);
        assert_eq!(entities.processed, 3);
        assert_eq!(entities.pages, 2);
        assert_eq!(entities.total, Some(3));
        assert_eq!(session.progress.kind(RecordKind::Enumeration).processed, 1);
        assert_eq!(session.progress.kind(RecordKind::Label).processed, 3);

        let version_id = session.version_id.unwrap();
        let stored = h
            .db
            .records()
            .get(h.env.id, version_id, RecordKind::DataEntity, "CustomersV3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.record.header().unwrap().label_text.as_deref(),
            Some("Customers")
        );

        let env = h.db.environments().get(h.env.id).await.unwrap().unwrap();
        assert!(env.has_synced());

        let history = h.orchestrator.history(h.env.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SyncState::Completed);
        assert!(h.orchestrator.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_start_returns_running_session() {
        let h = harness().await;
        h.source.set_pages(RecordKind::DataEntity, vec![vec![entity_json("A", None)]]);
        h.source.hold_pages_from(0);

        let first = h.start(SyncMode::Full, SyncScope::All).unwrap();
        match h.start(SyncMode::Full, SyncScope::All) {
            Err(MetaError::SyncAlreadyInProgress { session_id }) => assert_eq!(session_id, first),
            other => panic!("expected SyncAlreadyInProgress, got {other:?}"),
        }
        let joined = h
            .orchestrator
            .start_or_join(h.env.clone(), h.source.clone(), SyncMode::Incremental, SyncScope::All)
            .unwrap();
        assert_eq!(joined, first);

        // A single kind already covered by the running full session.
        match h.start(SyncMode::Full, SyncScope::Kind(RecordKind::DataEntity)) {
            Err(MetaError::SyncAlreadyInProgress { session_id }) => assert_eq!(session_id, first),
            other => panic!("expected SyncAlreadyInProgress, got {other:?}"),
        }
        assert_eq!(h.orchestrator.list_active().len(), 1);

        h.source.release_pages(100);
        assert_eq!(h.orchestrator.wait(first).await.unwrap().state, SyncState::Completed);

        // The slot is free again.
        let again = h.start(SyncMode::Full, SyncScope::All).unwrap();
        assert_ne!(again, first);
        h.orchestrator.wait(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_kinds_run_side_by_side() {
        let h = harness().await;
        h.source.set_pages(RecordKind::DataEntity, vec![vec![entity_json("A", None)]]);
        h.source.set_pages(RecordKind::Enumeration, vec![vec![enum_json("NoYes", "@SYS10")]]);
        h.source.hold_pages_from(0);

        let entities = h.start(SyncMode::Full, SyncScope::Kind(RecordKind::DataEntity)).unwrap();
        let enums = h.start(SyncMode::Full, SyncScope::Kind(RecordKind::Enumeration)).unwrap();
        assert_ne!(entities, enums);
        assert_eq!(h.orchestrator.list_active().len(), 2);

        // Overlaps both running sessions.
        assert!(matches!(
            h.start(SyncMode::Full, SyncScope::All),
            Err(MetaError::SyncAlreadyInProgress { .. })
        ));

        h.source.release_pages(100);
        assert_eq!(h.orchestrator.wait(entities).await.unwrap().state, SyncState::Completed);
        assert_eq!(h.orchestrator.wait(enums).await.unwrap().state, SyncState::Completed);

        // Both sessions released every kind they held.
        let all = h.start(SyncMode::Full, SyncScope::All).unwrap();
        assert_eq!(h.orchestrator.wait(all).await.unwrap().state, SyncState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_keeps_completed_pages_only() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![
                vec![entity_json("A1", None), entity_json("A2", None)],
                vec![entity_json("B1", None), entity_json("B2", None)],
                vec![entity_json("C1", None), entity_json("C2", None)],
            ],
        );
        h.source.hold_pages_from(1);

        let id = h.start(SyncMode::Full, SyncScope::All).unwrap();
        h.source.page_blocked().await;
        assert!(h.orchestrator.cancel(id).await.unwrap());
        h.source.release_pages(10);

        let session = h.orchestrator.wait(id).await.unwrap();
        assert_eq!(session.state, SyncState::Cancelled);
        assert_eq!(session.progress.kind(RecordKind::DataEntity).pages, 2);
        assert_eq!(h.names(&session).await, vec!["A1", "A2", "B1", "B2"]);
        assert_eq!(h.source.page_calls(), 2);

        let env = h.db.environments().get(h.env.id).await.unwrap().unwrap();
        assert!(!env.has_synced());

        // Cancelling a finished session is a no-op.
        assert!(!h.orchestrator.cancel(id).await.unwrap());
        let persisted = h.orchestrator.get_progress(id).await.unwrap();
        assert_eq!(persisted.state, SyncState::Cancelled);
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let h = harness().await;
        h.source.set_pages(RecordKind::DataEntity, vec![vec![entity_json("A", None)]]);
        h.source.fail_pages([
            UpstreamError::Timeout("slow".into()),
            UpstreamError::RateLimited {
                retry_after_secs: None,
            },
        ]);

        let session = h.run(SyncMode::Full).await;

        assert_eq!(session.state, SyncState::Completed);
        assert_eq!(h.names(&session).await, vec!["A"]);
        // Two failed attempts, then one page per kind.
        assert_eq!(h.source.page_calls(), 2 + RecordKind::SYNC_ORDER.len());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_fails_session() {
        let h = harness_with(SyncSettings {
            max_page_attempts: 3,
            ..fast_settings()
        })
        .await;
        h.source.fail_pages((0..5).map(|_| UpstreamError::Unavailable("down".into())));

        let session = h.run(SyncMode::Full).await;

        assert_eq!(session.state, SyncState::Failed);
        assert!(session.error.as_deref().unwrap().contains("down"));
        assert_eq!(h.source.page_calls(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately_keeping_pages() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![
                vec![entity_json("A1", None), entity_json("A2", None)],
                vec![entity_json("B1", None)],
            ],
        );
        h.source.hold_pages_from(1);

        let id = h.start(SyncMode::Full, SyncScope::All).unwrap();
        h.source.page_blocked().await;
        h.source.fail_pages([UpstreamError::Rejected("401".into())]);
        h.source.release_pages(10);

        let session = h.orchestrator.wait(id).await.unwrap();
        assert_eq!(session.state, SyncState::Failed);
        let error = session.error.clone().unwrap();
        assert!(error.contains("Sync failed after 2 records"), "{error}");
        assert_eq!(h.source.page_calls(), 2);
        assert_eq!(h.names(&session).await.len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_promoted_then_skips_unmodified() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![vec![
                modified_entity_json("Old", "2000-01-01T00:00:00Z"),
                modified_entity_json("New", "2999-01-01T00:00:00Z"),
            ]],
        );

        let first = h.run(SyncMode::Incremental).await;
        assert_eq!(first.mode, SyncMode::Full);
        assert_eq!(first.progress.kind(RecordKind::DataEntity).processed, 2);

        let second = h.run(SyncMode::Incremental).await;
        assert_eq!(second.state, SyncState::Completed);
        assert_eq!(second.mode, SyncMode::Incremental);
        let progress = second.progress.kind(RecordKind::DataEntity);
        assert_eq!(progress.processed, 1);
        assert_eq!(progress.skipped, 1);
        // Incremental sessions never delete.
        assert_eq!(h.names(&second).await, vec!["New", "Old"]);
    }

    #[tokio::test]
    async fn test_full_sync_detects_removals() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![vec![entity_json("A", None), entity_json("B", None), entity_json("C", None)]],
        );
        h.run(SyncMode::Full).await;

        h.source.set_pages(
            RecordKind::DataEntity,
            vec![vec![entity_json("A", None), entity_json("C", None)]],
        );
        let session = h.run(SyncMode::Full).await;

        assert_eq!(session.progress.kind(RecordKind::DataEntity).removed, 1);
        assert_eq!(h.names(&session).await, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_label_failure_does_not_fail_session() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![vec![entity_json("CustomersV3", Some("@SYS1"))]],
        );
        h.source.fail_labels(Some(UpstreamError::Unavailable("labels down".into())));

        let session = h.run(SyncMode::Full).await;

        assert_eq!(session.state, SyncState::Completed);
        assert_eq!(session.progress.kind(RecordKind::Label).skipped, 1);
        let stored = h
            .db
            .records()
            .get(h.env.id, session.version_id.unwrap(), RecordKind::DataEntity, "CustomersV3")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.record.header().unwrap().label_text.is_none());
    }

    #[tokio::test]
    async fn test_labels_resolved_in_batches() {
        let h = harness_with(fast_settings()).await;
        let pages = vec![(0..5)
            .map(|i| entity_json(&format!("E{i}"), Some(format!("@L{i}").as_str())))
            .collect()];
        h.source.set_pages(RecordKind::DataEntity, pages);
        for i in 0..5 {
            h.source.set_label(&format!("@L{i}"), "en-US", &format!("Label {i}"));
        }

        h.run(SyncMode::Full).await;
        // Default batch size covers all five labels in one call.
        assert_eq!(h.source.label_requests().len(), 1);
        assert_eq!(h.source.label_requests()[0].len(), 5);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let h = harness_with(SyncSettings {
            history_limit: 2,
            ..fast_settings()
        })
        .await;

        for _ in 0..3 {
            h.run(SyncMode::Full).await;
        }

        assert_eq!(h.orchestrator.history(h.env.id, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness().await;
        let id = SessionId::new();
        assert!(matches!(
            h.orchestrator.get_progress(id).await,
            Err(MetaError::SessionNotFound(_))
        ));
        assert!(matches!(
            h.orchestrator.cancel(id).await,
            Err(MetaError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_version_failure_without_history_fails_session() {
        let h = harness().await;
        h.source.fail_version(UpstreamError::Unavailable("no route".into()));

        let session = h.run(SyncMode::Full).await;
        assert_eq!(session.state, SyncState::Failed);
        assert_eq!(h.source.page_calls(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_sessions() {
        let h = harness().await;
        h.source.set_pages(
            RecordKind::DataEntity,
            vec![vec![entity_json("A", None)], vec![entity_json("B", None)]],
        );
        h.source.hold_pages_from(1);

        let id = h.start(SyncMode::Full, SyncScope::All).unwrap();
        h.source.page_blocked().await;

        let orchestrator = h.orchestrator.clone();
        let stopping = tokio::spawn(async move { orchestrator.shutdown().await });
        tokio::task::yield_now().await;
        h.source.release_pages(10);
        stopping.await.unwrap();

        assert_eq!(
            h.orchestrator.get_progress(id).await.unwrap().state,
            SyncState::Cancelled
        );
        assert!(matches!(
            h.start(SyncMode::Full, SyncScope::All),
            Err(MetaError::ShuttingDown)
        ));
    }
}

//! # Version Resolver
//!
//! Determines which generation of metadata an environment currently serves.
//!
//! ```text
//! resolve(env)
//!   │
//!   ├── cached & younger than TTL ──────────────────────► cached version
//!   │
//!   ├── fetch_version() ok
//!   │     ├── upsert metadata_versions (by fingerprint)
//!   │     ├── differs from env.current_version_id?
//!   │     │     yes ─► set_current_version + prune old versions
//!   │     └── cache (version, now) ───────────────────────► fresh version
//!   │
//!   └── fetch_version() failed
//!         ├── last known (cache, then env row) ───────────► fallback version
//!         └── nothing known ──────────────────────────────► UpstreamUnavailable
//! ```
//!
//! A failed check never invalidates anything and does not refresh the TTL,
//! so the next call asks upstream again.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MetaError, MetaResult};
use crate::upstream::MetadataSource;
use metacache_core::{Environment, EnvironmentId, StoredVersion, VersionId};
use metacache_db::Database;

/// Outcome of a version check.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub version: StoredVersion,
    /// The environment moved to a different version during this call.
    pub changed: bool,
    /// Version the environment pointed at before a change.
    pub previous: Option<VersionId>,
    /// Upstream could not be reached; `version` is the last known one.
    pub fallback: bool,
}

#[derive(Debug, Clone)]
struct CachedVersion {
    version: StoredVersion,
    resolved_at: Instant,
}

/// Per-environment version cache in front of the upstream version endpoint.
pub struct VersionResolver {
    db: Database,
    ttl: Duration,
    retain: usize,
    cache: Mutex<HashMap<EnvironmentId, CachedVersion>>,
}

impl VersionResolver {
    pub fn new(db: Database, ttl: Duration, retain: usize) -> Self {
        VersionResolver {
            db,
            ttl,
            retain: retain.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the current version of `env`, asking upstream at most once per TTL.
    pub async fn resolve(
        &self,
        env: &Environment,
        source: &dyn MetadataSource,
    ) -> MetaResult<Resolution> {
        let cached = self.cache.lock().get(&env.id).cloned();

        if let Some(entry) = &cached {
            if entry.resolved_at.elapsed() < self.ttl {
                return Ok(Resolution {
                    version: entry.version.clone(),
                    changed: false,
                    previous: None,
                    fallback: false,
                });
            }
        }

        let fetched = match source.fetch_version().await {
            Ok(version) => version,
            Err(err) => {
                warn!(environment_id = env.id, error = %err, "Version check failed");
                return self.fallback(env, cached, err.into()).await;
            }
        };

        let stored = self.db.versions().upsert(env.id, &fetched).await?;
        let previous = env.current_version_id;
        let changed = previous != Some(stored.id);

        if changed {
            self.db.environments().set_current_version(env.id, stored.id).await?;
            let pruned = self
                .db
                .versions()
                .prune(env.id, self.retain, Some(stored.id))
                .await?;
            info!(
                environment_id = env.id,
                version_id = stored.id,
                version = %stored.version,
                pruned = pruned.len(),
                "Environment moved to new metadata version"
            );
        } else {
            debug!(environment_id = env.id, version_id = stored.id, "Version unchanged");
        }

        self.cache.lock().insert(
            env.id,
            CachedVersion {
                version: stored.clone(),
                resolved_at: Instant::now(),
            },
        );

        Ok(Resolution {
            version: stored,
            changed,
            previous: if changed { previous } else { None },
            fallback: false,
        })
    }

    async fn fallback(
        &self,
        env: &Environment,
        cached: Option<CachedVersion>,
        err: MetaError,
    ) -> MetaResult<Resolution> {
        let known = match cached {
            Some(entry) => Some(entry.version),
            None => match env.current_version_id {
                Some(id) => self.db.versions().get(id).await?,
                None => None,
            },
        };

        match known {
            Some(version) => Ok(Resolution {
                version,
                changed: false,
                previous: None,
                fallback: true,
            }),
            None => Err(err),
        }
    }

    /// Drops the cached version so the next call asks upstream.
    pub fn forget(&self, environment_id: EnvironmentId) {
        self.cache.lock().remove(&environment_id);
    }
}

//! # Service Configuration
//!
//! Configuration for the relational tier, the fast tiers, version
//! resolution, sync sessions and label resolution.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     METACACHE_DB_PATH=/var/lib/metacache/metacache.db                  │
//! │     METACACHE_VERSION_TTL_SECS=60                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/metacache/metacache.toml (Linux)                         │
//! │     ~/Library/Application Support/dev.metacache.metacache/... (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/metacache/metacache.db"
//! max_connections = 5
//!
//! [cache]
//! memory_capacity = 10000
//! disk_enabled = true
//! disk_budget_bytes = 67108864
//!
//! [version]
//! ttl_secs = 300
//! retained_versions = 2
//!
//! [sync]
//! max_page_attempts = 5
//! initial_backoff_ms = 250
//! max_backoff_ms = 30000
//! history_limit = 50
//! write_granularity = "record"   # record | page
//! auto_sync_on_stale = true
//!
//! [labels]
//! language = "en-US"
//! batch_size = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{MetaError, MetaResult};
use metacache_core::{DEFAULT_LANGUAGE, DEFAULT_RETAINED_VERSIONS};
use metacache_db::{DbConfig, WriteGranularity};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join("metacache.db"))
        .unwrap_or_else(|| PathBuf::from("metacache.db"))
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    pub fn to_db_config(&self) -> DbConfig {
        if self.path.as_os_str() == ":memory:" {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&self.path).max_connections(self.max_connections)
        }
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum records held by the in-process tier.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: u64,

    #[serde(default = "default_true")]
    pub disk_enabled: bool,

    /// Disk tier root. One subdirectory per environment is created under it.
    #[serde(default = "default_disk_dir")]
    pub disk_dir: PathBuf,

    /// Byte budget of the disk tier; oldest writes are evicted first.
    #[serde(default = "default_disk_budget")]
    pub disk_budget_bytes: u64,
}

fn default_memory_capacity() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_disk_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("metacache"))
}
fn default_disk_budget() -> u64 {
    64 * 1024 * 1024
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            memory_capacity: default_memory_capacity(),
            disk_enabled: true,
            disk_dir: default_disk_dir(),
            disk_budget_bytes: default_disk_budget(),
        }
    }
}

// =============================================================================
// Version Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSettings {
    /// How long a resolved version is trusted before asking upstream again.
    #[serde(default = "default_version_ttl")]
    pub ttl_secs: u64,

    /// Versions kept per environment (the current one always survives).
    #[serde(default = "default_retained_versions")]
    pub retained_versions: usize,
}

fn default_version_ttl() -> u64 {
    300
}
fn default_retained_versions() -> usize {
    DEFAULT_RETAINED_VERSIONS
}

impl Default for VersionSettings {
    fn default() -> Self {
        VersionSettings {
            ttl_secs: default_version_ttl(),
            retained_versions: default_retained_versions(),
        }
    }
}

impl VersionSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Attempts per page before a retryable upstream error fails the session.
    #[serde(default = "default_max_page_attempts")]
    pub max_page_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Finished sessions kept per environment.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub write_granularity: WriteGranularity,

    /// Start a background sync when a read finds stale or missing data.
    #[serde(default = "default_true")]
    pub auto_sync_on_stale: bool,
}

fn default_max_page_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_history_limit() -> usize {
    50
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_page_attempts: default_max_page_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            history_limit: default_history_limit(),
            write_granularity: WriteGranularity::default(),
            auto_sync_on_stale: true,
        }
    }
}

impl SyncSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// =============================================================================
// Label Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSettings {
    /// Language used when resolving label text during sync.
    #[serde(default = "default_language")]
    pub language: String,

    /// Labels per upstream batch call during the label phase of a sync.
    #[serde(default = "default_label_batch")]
    pub batch_size: usize,

    /// Capacity of the in-process label cache.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: u64,
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}
fn default_label_batch() -> usize {
    100
}

impl Default for LabelSettings {
    fn default() -> Self {
        LabelSettings {
            language: default_language(),
            batch_size: default_label_batch(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetacacheConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub version: VersionSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub labels: LabelSettings,
}

impl MetacacheConfig {
    /// An in-memory database with the disk tier disabled.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.database.path = PathBuf::from(":memory:");
        config.cache.disk_enabled = false;
        config
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (metacache.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> MetaResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| MetaError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> MetaResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| MetaError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetaError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| MetaError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> MetaResult<()> {
        if self.cache.memory_capacity == 0 {
            return Err(MetaError::InvalidConfig(
                "cache.memory_capacity must be greater than 0".into(),
            ));
        }
        if self.cache.disk_enabled && self.cache.disk_budget_bytes == 0 {
            return Err(MetaError::InvalidConfig(
                "cache.disk_budget_bytes must be greater than 0 when the disk tier is enabled"
                    .into(),
            ));
        }
        if self.version.retained_versions == 0 {
            return Err(MetaError::InvalidConfig(
                "version.retained_versions must be at least 1".into(),
            ));
        }
        if self.sync.max_page_attempts == 0 {
            return Err(MetaError::InvalidConfig(
                "sync.max_page_attempts must be at least 1".into(),
            ));
        }
        if self.sync.initial_backoff_ms > self.sync.max_backoff_ms {
            return Err(MetaError::InvalidConfig(format!(
                "sync.initial_backoff_ms ({}) exceeds sync.max_backoff_ms ({})",
                self.sync.initial_backoff_ms, self.sync.max_backoff_ms
            )));
        }
        if self.labels.batch_size == 0 {
            return Err(MetaError::InvalidConfig(
                "labels.batch_size must be greater than 0".into(),
            ));
        }
        if self.labels.language.trim().is_empty() {
            return Err(MetaError::InvalidConfig("labels.language must not be empty".into()));
        }
        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("METACACHE_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(dir) = lookup("METACACHE_CACHE_DIR") {
            self.cache.disk_dir = PathBuf::from(dir);
        }

        if let Some(n) = parsed(&lookup, "METACACHE_MEMORY_CAPACITY") {
            self.cache.memory_capacity = n;
        }

        if let Some(n) = parsed(&lookup, "METACACHE_DISK_BUDGET_BYTES") {
            self.cache.disk_budget_bytes = n;
        }

        if let Some(n) = parsed(&lookup, "METACACHE_VERSION_TTL_SECS") {
            debug!(ttl_secs = n, "Overriding version TTL from environment");
            self.version.ttl_secs = n;
        }

        if let Some(language) = lookup("METACACHE_LANGUAGE") {
            self.labels.language = language;
        }

        if let Some(n) = parsed(&lookup, "METACACHE_MAX_PAGE_ATTEMPTS") {
            self.sync.max_page_attempts = n;
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("metacache.toml"))
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "metacache", "metacache")
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

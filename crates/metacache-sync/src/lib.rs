//! # metacache-sync: Tiered Cache and Sync Engine
//!
//! Serves ERP metadata (data entities, actions, enumerations, labels) from
//! local tiers and keeps those tiers in step with the remote environment.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Metacache Engine                                │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                  MetadataService (facade)                        │  │
//! │  │   get · search · find · start_sync · statistics · invalidate     │  │
//! │  └───────┬──────────────────┬───────────────────────┬───────────────┘  │
//! │          │                  │                       │                  │
//! │          ▼                  ▼                       ▼                  │
//! │  ┌───────────────┐  ┌────────────────┐  ┌──────────────────────────┐  │
//! │  │VersionResolver│  │  TieredStore   │  │    SyncOrchestrator      │  │
//! │  │               │  │                │  │                          │  │
//! │  │ TTL cache of  │  │ memory (moka)  │  │ one session per env +    │  │
//! │  │ the upstream  │  │ → disk (json)  │  │ scope, paged fetch with  │  │
//! │  │ version       │  │ → relational   │  │ backoff, cancellation    │  │
//! │  └───────────────┘  └────────────────┘  └────────────┬─────────────┘  │
//! │                                                      │                 │
//! │  ┌───────────────┐                      ┌────────────▼─────────────┐  │
//! │  │ LabelResolver │◄─────────────────────│     MetadataSource       │  │
//! │  │ batch, dedup  │                      │  (upstream boundary)     │  │
//! │  └───────────────┘                      └──────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`service`] - `MetadataService` facade
//! - [`store`] - Tiered lookup, promotion and invalidation
//! - [`cache`] - In-process tier
//! - [`disk`] - Disk tier with a byte budget
//! - [`version`] - Upstream version resolution
//! - [`labels`] - Batched label resolution
//! - [`orchestrator`] - Sync sessions
//! - [`upstream`] - `MetadataSource` trait and payload decoding
//! - [`config`] - TOML configuration with env overrides
//! - [`error`] - Service error types
//! - [`telemetry`] - Tracing subscriber setup
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metacache_sync::{MetacacheConfig, MetadataService};
//! use metacache_core::{RecordKind, SyncMode, SyncScope};
//!
//! let service = MetadataService::open(MetacacheConfig::load_or_default(None)).await?;
//! let env = service.register_environment("https://erp.example.com/", source).await?;
//!
//! let session = service.start_sync(env.id, SyncMode::Full, SyncScope::All).await?;
//! service.wait_for_sync(session).await?;
//!
//! let lookup = service.get(env.id, RecordKind::DataEntity, "CustomersV3").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod labels;
pub mod orchestrator;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod upstream;
pub mod version;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{
    CacheSettings, DatabaseSettings, LabelSettings, MetacacheConfig, SyncSettings, VersionSettings,
};
pub use error::{MetaError, MetaResult};
pub use labels::{LabelResolution, LabelResolver};
pub use orchestrator::SyncOrchestrator;
pub use service::{FindResult, MetadataService, Statistics};
pub use store::{CacheCounters, InvalidationReport, Lookup, MissReason, Tier, TieredStore};
pub use telemetry::{init_tracing, try_init_tracing};
pub use upstream::{MetadataSource, PageRequest, RawPage, UpstreamError};
pub use version::{Resolution, VersionResolver};

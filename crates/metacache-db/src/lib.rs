//! # metacache-db: Relational Tier of the Metadata Cache
//!
//! The durable, queryable, multi-environment tier. It is the source of truth
//! for every faster tier above it.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Metacache Data Flow                              │
//! │                                                                         │
//! │  TieredStore::get (in-process miss, disk miss)                         │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   metacache-db (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │   │   │
//! │  │   │               │    │ Environments   │   │              │   │   │
//! │  │   │ SqlitePool    │◄───│ Versions       │   │ 001_initial  │   │   │
//! │  │   │               │    │ Records ──────────► SearchIndex   │   │   │
//! │  │   │               │    │ Labels         │   │ 002_search   │   │   │
//! │  │   │               │    │ Sessions       │   │              │   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite database (WAL) with an FTS5 virtual table                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Repository implementations
//! - [`search`] - Lexical index maintenance and queries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use metacache_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("metacache.db")).await?;
//! let env = db.environments().get_or_create("https://erp.example.com").await?;
//! let hits = db.search().search(env.id, version_id, "customer", None, 20).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod search;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::environment::EnvironmentRepository;
pub use repository::label::LabelRepository;
pub use repository::record::{RecordRepository, StoredRecord, UpsertOutcome, WriteGranularity};
pub use repository::session::SessionRepository;
pub use repository::version::VersionRepository;
pub use search::SearchIndex;

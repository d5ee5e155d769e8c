//! # metacache-core: Pure Domain Types for the Metadata Cache
//!
//! Everything the cache knows about ERP metadata, expressed without I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Metacache Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │         Tool / resource layer (external collaborator)           │   │
//! │  │     get(kind, key) · search(text) · start_sync · statistics     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                   metacache-sync (engine)                       │   │
//! │  │   TieredStore · VersionResolver · LabelResolver · Orchestrator  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ metacache-core (THIS CRATE) ★                   │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐   │   │
//! │  │   │   types   │  │  session  │  │  lexical  │  │   error   │   │   │
//! │  │   │  Records  │  │ SyncState │  │  scoring  │  │ CoreError │   │   │
//! │  │   │  Version  │  │ Progress  │  │  snippets │  │           │   │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘   │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Record kinds, tagged record variants, versions, environments
//! - [`session`] - Sync session state machine and progress counters
//! - [`lexical`] - Relevance tiers, snippet extraction, pattern helpers
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use metacache_core::lexical::{score_fields, MatchTier};
//!
//! let fields = [("name", "CustomersV3"), ("category", "Master")];
//! let score = score_fields("customers", &fields).unwrap();
//! assert_eq!(score.tier, MatchTier::Substring);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod lexical;
pub mod session;
pub mod types;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult};
pub use lexical::{MatchTier, SearchHit};
pub use session::{KindProgress, SessionId, SyncMode, SyncProgress, SyncScope, SyncSession, SyncState};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default language tag used when a caller does not ask for one.
pub const DEFAULT_LANGUAGE: &str = "en-US";

/// Number of metadata versions kept per environment unless configured.
///
/// Two generations allow comparing the current metadata with the previous one.
pub const DEFAULT_RETAINED_VERSIONS: usize = 2;

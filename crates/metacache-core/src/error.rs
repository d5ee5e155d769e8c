//! # Error Types
//!
//! Domain-specific error types for metacache-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  metacache-core errors (this file)                                     │
//! │  └── CoreError        - Parsing and state machine violations           │
//! │                                                                         │
//! │  metacache-db errors (separate crate)                                  │
//! │  └── DbError          - Relational tier failures                       │
//! │                                                                         │
//! │  metacache-sync errors (separate crate)                                │
//! │  ├── UpstreamError    - Failures reported by the metadata endpoints    │
//! │  └── MetaError        - What callers of the service see                │
//! │                                                                         │
//! │  Flow: CoreError → DbError → MetaError → tool layer                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::session::SyncState;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A record kind string did not name a known kind.
    #[error("Unknown record kind: '{0}'")]
    UnknownRecordKind(String),

    /// A sync mode string did not name a known mode.
    #[error("Unknown sync mode: '{0}'. Valid options: full, incremental")]
    UnknownSyncMode(String),

    /// A session state string did not name a known state.
    #[error("Unknown sync state: '{0}'")]
    UnknownSyncState(String),

    /// A session was asked to move along an edge the state machine forbids.
    ///
    /// ## When This Occurs
    /// - Completing a session that is still `pending`
    /// - Touching a session that already reached a terminal state
    #[error("Invalid sync transition: {from} -> {to}")]
    InvalidTransition { from: SyncState, to: SyncState },

    /// A label lookup key was not of the form `language/label_id`.
    #[error("Invalid label key: '{0}'")]
    InvalidLabelKey(String),
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = CoreError::InvalidTransition {
            from: SyncState::Completed,
            to: SyncState::Running,
        };
        assert_eq!(err.to_string(), "Invalid sync transition: completed -> running");
    }

    #[test]
    fn test_unknown_kind_message() {
        let err = CoreError::UnknownRecordKind("widget".into());
        assert!(err.to_string().contains("widget"));
    }
}

//! # Service Error Types
//!
//! Errors surfaced by the cache, the resolvers and the sync orchestrator.
//!
//! ## Error Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Metacache Error Categories                        │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Upstream     │  │      Sync       │  │     Configuration       │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  Unavailable ↻  │  │  AlreadyIn-     │  │  InvalidConfig          │ │
//! │  │  Rejected       │  │   Progress      │  │  ConfigLoadFailed       │ │
//! │  │                 │  │  PartialFailure │  │  ConfigSaveFailed       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │     Storage     │  │     Lookup      │   ↻ = retryable              │
//! │  │                 │  │                 │                              │
//! │  │  Database       │  │  Environment-   │   A missing or stale record  │
//! │  │  Io             │  │   NotFound      │   is not an error: see       │
//! │  │  Serialization  │  │  SessionNotFound│   `store::Lookup::NotFound`  │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

use crate::upstream::UpstreamError;
use metacache_core::SessionId;

/// Result type alias for service operations.
pub type MetaResult<T> = Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// Network failure or timeout talking to the upstream service.
    /// Existing cache contents stay valid.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream refused the request (auth, validation, malformed payload).
    #[error("Upstream rejected request: {0}")]
    UpstreamRejected(String),

    // =========================================================================
    // Sync Errors
    // =========================================================================
    /// A session of the same environment already holds one of the requested kinds.
    /// Poll its progress instead of starting another.
    #[error("Sync already in progress: session {session_id}")]
    SyncAlreadyInProgress { session_id: SessionId },

    /// A session failed after durably applying part of its work.
    #[error("Sync failed after {processed} records: {detail}")]
    PartialSyncFailure { processed: u64, detail: String },

    #[error("Sync session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Environment not registered: {0}")]
    EnvironmentNotFound(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    #[error("Database error: {0}")]
    Database(#[from] metacache_db::DbError),

    /// Disk tier I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<UpstreamError> for MetaError {
    fn from(err: UpstreamError) -> Self {
        if err.is_retryable() {
            MetaError::UpstreamUnavailable(err.to_string())
        } else {
            MetaError::UpstreamRejected(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        MetaError::Serialization(err.to_string())
    }
}

impl From<metacache_core::CoreError> for MetaError {
    fn from(err: metacache_core::CoreError) -> Self {
        MetaError::Internal(err.to_string())
    }
}

impl From<toml::de::Error> for MetaError {
    fn from(err: toml::de::Error) -> Self {
        MetaError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for MetaError {
    fn from(err: toml::ser::Error) -> Self {
        MetaError::ConfigSaveFailed(err.to_string())
    }
}

impl From<url::ParseError> for MetaError {
    fn from(err: url::ParseError) -> Self {
        MetaError::InvalidConfig(format!("invalid environment URL: {err}"))
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl MetaError {
    /// Returns true if the operation may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::UpstreamUnavailable(_) | MetaError::SyncAlreadyInProgress { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            MetaError::InvalidConfig(_)
                | MetaError::ConfigLoadFailed(_)
                | MetaError::ConfigSaveFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_errors_map_by_retryability() {
        let err: MetaError = UpstreamError::Timeout("30s".into()).into();
        assert!(matches!(err, MetaError::UpstreamUnavailable(_)));
        assert!(err.is_retryable());

        let err: MetaError = UpstreamError::Rejected("401 Unauthorized".into()).into();
        assert!(matches!(err, MetaError::UpstreamRejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let id = SessionId::new();
        let err = MetaError::SyncAlreadyInProgress { session_id: id };
        assert!(err.to_string().contains(&id.to_string()));

        let err = MetaError::PartialSyncFailure {
            processed: 120,
            detail: "upstream rejected page".into(),
        };
        assert!(err.to_string().contains("120"));
        assert!(!err.is_config_error());
    }
}

//! # Logging Setup
//!
//! `tracing-subscriber` initialization for embedders and tests.
//!
//! ```text
//! RUST_LOG set?  ── yes ──► use it
//!       │
//!       no
//!       ▼
//! DEFAULT_FILTER: info for everything, debug for metacache crates,
//!                 warn for sqlx statement logging
//! ```

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,metacache=debug,sqlx=warn";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global fmt subscriber.
///
/// ## Panics
/// If a global subscriber is already installed. Use [`try_init_tracing`]
/// when that is possible.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_max_level(Level::TRACE)
        .init();
}

/// Installs the global fmt subscriber unless one is already installed.
///
/// Returns true if this call installed it.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_try_init_is_idempotent() {
        try_init_tracing();
        assert!(!try_init_tracing());
    }
}

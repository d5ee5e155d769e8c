//! # Sync Sessions
//!
//! The state machine of one bounded execution of metadata population.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SyncSession Lifecycle                             │
//! │                                                                         │
//! │   ┌─────────┐  start   ┌─────────┐  all pages applied  ┌───────────┐   │
//! │   │ Pending │ ───────► │ Running │ ──────────────────► │ Completed │   │
//! │   └─────────┘          └────┬────┘                     └───────────┘   │
//! │                             │                                           │
//! │              retry budget   │   cancel token observed                  │
//! │              exhausted or   │   between pages                          │
//! │              rejected       │                                           │
//! │                   ┌─────────┴─────────┐                                 │
//! │                   ▼                   ▼                                 │
//! │             ┌──────────┐        ┌───────────┐                           │
//! │             │  Failed  │        │ Cancelled │                           │
//! │             └──────────┘        └───────────┘                           │
//! │                                                                         │
//! │  Terminal states are immutable. Writes from completed pages are kept   │
//! │  in every terminal state.                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{EnvironmentId, RecordKind, VersionId};

// =============================================================================
// Identifiers
// =============================================================================

/// Unique identifier of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

// =============================================================================
// Sync State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SyncState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncState::Completed | SyncState::Failed | SyncState::Cancelled
        )
    }

    /// Returns true if the state machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        matches!(
            (self, next),
            (SyncState::Pending, SyncState::Running)
                | (SyncState::Running, SyncState::Completed)
                | (SyncState::Running, SyncState::Failed)
                | (SyncState::Running, SyncState::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Running => "running",
            SyncState::Completed => "completed",
            SyncState::Failed => "failed",
            SyncState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncState::Pending),
            "running" => Ok(SyncState::Running),
            "completed" => Ok(SyncState::Completed),
            "failed" => Ok(SyncState::Failed),
            "cancelled" => Ok(SyncState::Cancelled),
            other => Err(CoreError::UnknownSyncState(other.to_string())),
        }
    }
}

// =============================================================================
// Sync Mode and Scope
// =============================================================================

/// Full or incremental population.
///
/// ```text
/// FULL          every fetched record is an upsert; rows not touched by the
///               session are deleted once the kind is fully fetched
/// INCREMENTAL   only records modified after the last successful sync
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Full,
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "delta" => Ok(SyncMode::Incremental),
            other => Err(CoreError::UnknownSyncMode(other.to_string())),
        }
    }
}

/// Which record kinds a session populates.
///
/// A running session holds every kind its scope covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Every relational kind in sync order, then the labels they reference.
    #[default]
    All,
    /// A single kind (labels referenced by it are still resolved).
    Kind(RecordKind),
}

impl SyncScope {
    /// Relational kinds the scope covers, in sync order.
    pub fn kinds(&self) -> Vec<RecordKind> {
        match self {
            SyncScope::All => RecordKind::SYNC_ORDER.to_vec(),
            SyncScope::Kind(RecordKind::Label) => Vec::new(),
            SyncScope::Kind(kind) => vec![*kind],
        }
    }

    pub fn covers(&self, kind: RecordKind) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Kind(k) => *k == kind,
        }
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::All => write!(f, "all"),
            SyncScope::Kind(kind) => write!(f, "{}", kind),
        }
    }
}

impl std::str::FromStr for SyncScope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(SyncScope::All);
        }
        s.parse().map(SyncScope::Kind)
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Progress counters for one record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindProgress {
    /// Records applied to the relational tier.
    pub processed: u64,
    /// Records skipped as unchanged (incremental sync).
    pub skipped: u64,
    /// Total reported by upstream, if it reports one.
    pub total: Option<u64>,
    /// Pages fully applied.
    pub pages: u64,
    /// Rows deleted as removed upstream (full sync).
    pub removed: u64,
}

/// Progress counters for a whole session, per record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub kinds: BTreeMap<RecordKind, KindProgress>,
}

impl SyncProgress {
    pub fn kind_mut(&mut self, kind: RecordKind) -> &mut KindProgress {
        self.kinds.entry(kind).or_default()
    }

    pub fn kind(&self, kind: RecordKind) -> KindProgress {
        self.kinds.get(&kind).copied().unwrap_or_default()
    }

    pub fn processed(&self) -> u64 {
        self.kinds.values().map(|k| k.processed).sum()
    }

    /// Sum of upstream totals; `None` until every started kind reported one.
    pub fn total(&self) -> Option<u64> {
        self.kinds.values().map(|k| k.total).sum()
    }
}

// =============================================================================
// Sync Session
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SessionId,
    pub environment_id: EnvironmentId,
    pub mode: SyncMode,
    pub scope: SyncScope,
    pub state: SyncState,
    /// Version the session populates; set when it starts running.
    pub version_id: Option<VersionId>,
    pub progress: SyncProgress,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Error detail on failure.
    pub error: Option<String>,
}

impl SyncSession {
    /// Creates a session in `pending`.
    pub fn new(environment_id: EnvironmentId, mode: SyncMode, scope: SyncScope) -> Self {
        SyncSession {
            id: SessionId::new(),
            environment_id,
            mode,
            scope,
            state: SyncState::Pending,
            version_id: None,
            progress: SyncProgress::default(),
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Moves the session along one edge of the state machine.
    pub fn transition(&mut self, next: SyncState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&mut self, detail: impl Into<String>) -> CoreResult<()> {
        self.transition(SyncState::Failed)?;
        self.error = Some(detail.into());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = SyncSession::new(1, SyncMode::Full, SyncScope::All);
        assert_eq!(session.state, SyncState::Pending);
        session.transition(SyncState::Running).unwrap();
        session.transition(SyncState::Completed).unwrap();
        assert!(session.ended_at.is_some());
        assert!(!session.is_active());
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut session = SyncSession::new(1, SyncMode::Full, SyncScope::All);
        session.transition(SyncState::Running).unwrap();
        session.transition(SyncState::Cancelled).unwrap();
        assert!(session.transition(SyncState::Running).is_err());
        assert!(session.fail("late").is_err());
        assert_eq!(session.state, SyncState::Cancelled);
        assert!(session.error.is_none());
    }

    #[test]
    fn test_pending_cannot_complete() {
        let mut session = SyncSession::new(1, SyncMode::Incremental, SyncScope::All);
        let err = session.transition(SyncState::Completed).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn test_scope_kinds() {
        assert_eq!(SyncScope::All.kinds().len(), 3);
        assert_eq!(
            SyncScope::Kind(RecordKind::Action).kinds(),
            vec![RecordKind::Action]
        );
        assert!(SyncScope::Kind(RecordKind::Label).kinds().is_empty());
        assert_eq!("all".parse::<SyncScope>().unwrap(), SyncScope::All);
        assert_eq!(
            "enumeration".parse::<SyncScope>().unwrap(),
            SyncScope::Kind(RecordKind::Enumeration)
        );
    }

    #[test]
    fn test_progress_totals() {
        let mut progress = SyncProgress::default();
        progress.kind_mut(RecordKind::DataEntity).processed = 3;
        progress.kind_mut(RecordKind::Action).processed = 2;
        assert_eq!(progress.processed(), 5);
        assert_eq!(progress.total(), None);

        progress.kind_mut(RecordKind::DataEntity).total = Some(3);
        progress.kind_mut(RecordKind::Action).total = Some(4);
        assert_eq!(progress.total(), Some(7));
    }
}

//! Sync session records and the orchestrator's published state.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use super::entries::{EntrySyncStats, PendingReplay};
use super::error::ErrorKind;
use super::feeds::FeedPassSummary;

/// What happened to one feed during the entry step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    Synced(EntrySyncStats),
    /// The remote no longer has the feed; it was removed locally.
    Vanished,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedOutcome {
    pub feed_id: String,
    pub result: FeedResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The pass ran to the end. Individual feeds may still have failed.
    Success,
    /// The pass stopped early. Work committed before the failure is kept.
    Failed(String),
}

/// Record of one finished pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionResult {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the pass failed before the feed step finished.
    pub feeds: Option<FeedPassSummary>,
    pub pending: PendingReplay,
    /// Sorted by feed id.
    pub outcomes: Vec<FeedOutcome>,
    pub status: SessionStatus,
}

impl SessionResult {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Success
    }

    /// Succeeded overall, but at least one feed failed.
    pub fn is_partial(&self) -> bool {
        self.is_success() && !self.failed_feeds().is_empty()
    }

    pub fn synced_feeds(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, FeedResult::Synced(_)))
            .map(|o| o.feed_id.as_str())
            .collect()
    }

    pub fn failed_feeds(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, FeedResult::Failed { .. }))
            .map(|o| o.feed_id.as_str())
            .collect()
    }

    pub fn vanished_feeds(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, FeedResult::Vanished))
            .map(|o| o.feed_id.as_str())
            .collect()
    }
}

/// Published orchestrator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Idle { last: Option<Arc<SessionResult>> },
    Running { session_id: Uuid, started_at: DateTime<Utc> },
}

impl SyncState {
    pub fn is_running(&self) -> bool {
        matches!(self, SyncState::Running { .. })
    }

    pub fn last_result(&self) -> Option<&Arc<SessionResult>> {
        match self {
            SyncState::Idle { last } => last.as_ref(),
            SyncState::Running { .. } => None,
        }
    }
}

/// Answer to a sync trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerResult {
    /// This call ran the pass (and any pass queued behind it).
    Ran(Arc<SessionResult>),
    /// A pass was already running; nothing new was started.
    Coalesced { running: Uuid },
    /// A pass was already running; one more will follow it.
    Queued { behind: Uuid },
}

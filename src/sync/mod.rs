//! Reconciliation of the local cache against the remote service.
//!
//! A pass replays stale pending flag changes, reconciles the feed list and
//! then merges every feed's entries. [`SyncOrchestrator`] sequences passes
//! and carries user-initiated mutations.

mod entries;
mod error;
mod feeds;
mod orchestrator;
mod retry;
mod session;

pub use entries::{
    replay_pending_flags, sync_feed_entries, EntrySyncStats, InFlightFlags, InFlightGuard, PendingReplay,
};
pub use error::{ErrorKind, SyncError};
pub use feeds::{apply, reconcile, sync_feeds, FeedChangeSet, FeedPassSummary};
pub use orchestrator::{SyncOrchestrator, SyncSettings};
pub use retry::RetryPolicy;
pub use session::{FeedOutcome, FeedResult, SessionResult, SessionStatus, SyncState, TriggerResult};

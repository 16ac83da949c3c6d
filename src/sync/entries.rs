//! Entry reconciliation: paged fetch, per-batch merge, pending flag replay.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use super::error::SyncError;
use super::retry::RetryPolicy;
use crate::remote::{RemoteClient, RemoteError};
use crate::storage::{BatchMerge, Database, EntryFlag};

/// Stops a backend that keeps reporting `has_more` from looping forever.
const MAX_PAGES_PER_FEED: usize = 1000;

/// Counters for one feed's share of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntrySyncStats {
    pub pages: usize,
    pub merged: BatchMerge,
}

/// Walk `feed_id`'s pages from the saved cursor, merging each page in its
/// own transaction.
///
/// Pages committed before a failure stay committed, together with the
/// cursor that follows them, so the next pass resumes where this one
/// stopped.
pub async fn sync_feed_entries(
    remote: &dyn RemoteClient,
    db: &Database,
    retry: &RetryPolicy,
    feed_id: &str,
) -> Result<EntrySyncStats, SyncError> {
    let mut stats = EntrySyncStats::default();
    let mut cursor = db.get_entry_cursor(feed_id).await?;

    loop {
        let watermark = db.flag_ack_watermark().await?;
        let page = retry
            .run(feed_id, || remote.list_entries(feed_id, cursor.as_deref()))
            .await?;

        // Records for other feeds are not ours to merge here
        let (entries, foreign): (Vec<_>, Vec<_>) =
            page.entries.into_iter().partition(|e| e.feed_id == feed_id);
        if !foreign.is_empty() {
            tracing::warn!(feed_id, skipped = foreign.len(), "Ignoring entries tagged with another feed");
        }

        let merged = db
            .merge_fetched_batch(feed_id, &entries, page.next_cursor.as_deref(), watermark)
            .await?;
        stats.pages += 1;
        stats.merged.absorb(merged);

        if !page.has_more {
            break;
        }
        match page.next_cursor {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
            _ => {
                tracing::warn!(feed_id, "Backend reported more entries without advancing the cursor");
                break;
            }
        }
        if stats.pages >= MAX_PAGES_PER_FEED {
            tracing::warn!(feed_id, pages = stats.pages, "Page limit reached, resuming next pass");
            break;
        }
    }

    tracing::debug!(
        feed_id,
        pages = stats.pages,
        inserted = stats.merged.inserted,
        updated = stats.merged.updated,
        conflicts = stats.merged.conflicts,
        "Entry sync finished for feed"
    );
    Ok(stats)
}

// ============================================================================
// In-flight flag mutations
// ============================================================================

/// `(entry, flag)` pairs whose remote call is currently running.
///
/// Shared between user mutations and the pass's replay of stale pending
/// rows, so the same change is never sent twice concurrently.
#[derive(Debug, Clone, Default)]
pub struct InFlightFlags {
    inner: Arc<Mutex<HashSet<(String, EntryFlag)>>>,
}

/// Removes its key from the in-flight set when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightFlags,
    key: (String, EntryFlag),
}

impl InFlightFlags {
    /// Mark a pair as in flight. `None` if it already is.
    pub fn claim(&self, entry_id: &str, flag: EntryFlag) -> Option<InFlightGuard> {
        let key = (entry_id.to_string(), flag);
        let inserted = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        inserted.then(|| InFlightGuard {
            set: self.clone(),
            key,
        })
    }

    pub fn contains(&self, entry_id: &str, flag: EntryFlag) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(entry_id.to_string(), flag))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Result of replaying pending flag rows at the start of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingReplay {
    /// Accepted by the remote and committed locally.
    pub acknowledged: usize,
    /// Dropped because the remote no longer has the entry.
    pub dropped: usize,
    /// Left pending after a recoverable failure.
    pub deferred: usize,
    /// Skipped because a user mutation is sending them right now.
    pub in_flight: usize,
}

/// Re-send pending flag changes left behind by a crash or a cancelled
/// mutation.
///
/// # Errors
///
/// Authentication failures and local storage errors end the replay; other
/// remote failures leave the row for the next pass.
pub async fn replay_pending_flags(
    remote: &dyn RemoteClient,
    db: &Database,
    retry: &RetryPolicy,
    in_flight: &InFlightFlags,
) -> Result<PendingReplay, SyncError> {
    let mut replay = PendingReplay::default();

    for pending in db.get_pending_flags().await? {
        let Some(_guard) = in_flight.claim(&pending.entry_id, pending.flag) else {
            replay.in_flight += 1;
            continue;
        };

        let sent = retry
            .run(&pending.entry_id, || {
                remote.set_entry_flag(&pending.entry_id, pending.flag, pending.value)
            })
            .await;

        match sent {
            Ok(()) => {
                db.ack_pending_flag(&pending.entry_id, pending.flag).await?;
                replay.acknowledged += 1;
            }
            Err(RemoteError::NotFound(_)) => {
                tracing::info!(
                    entry_id = %pending.entry_id,
                    flag = %pending.flag,
                    "Entry vanished remotely, dropping pending change"
                );
                db.fail_pending_flag(&pending.entry_id, pending.flag).await?;
                replay.dropped += 1;
            }
            Err(RemoteError::Auth) => return Err(RemoteError::Auth.into()),
            Err(e) => {
                tracing::warn!(
                    entry_id = %pending.entry_id,
                    flag = %pending.flag,
                    error = %e,
                    "Pending change not delivered, keeping it for the next pass"
                );
                replay.deferred += 1;
            }
        }
    }

    if replay != PendingReplay::default() {
        tracing::info!(
            acknowledged = replay.acknowledged,
            dropped = replay.dropped,
            deferred = replay.deferred,
            in_flight = replay.in_flight,
            "Replayed pending flag changes"
        );
    }
    Ok(replay)
}

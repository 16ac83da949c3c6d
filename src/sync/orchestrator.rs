//! The sync orchestrator: one pass at a time, feeds before entries,
//! per-feed isolation, and remote-first user mutations.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use super::entries::{replay_pending_flags, sync_feed_entries, EntrySyncStats, InFlightFlags};
use super::error::SyncError;
use super::feeds::sync_feeds;
use super::retry::RetryPolicy;
use super::session::{FeedOutcome, FeedResult, SessionResult, SessionStatus, SyncState, TriggerResult};
use crate::config::{Config, TriggerPolicy};
use crate::remote::{RemoteClient, RemoteError};
use crate::storage::{Database, EntryFlag, Feed};
use crate::util::normalize_title;

/// Knobs the orchestrator reads from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub max_concurrent_feeds: usize,
    pub retry: RetryPolicy,
    pub trigger_policy: TriggerPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_feeds: 4,
            retry: RetryPolicy::default(),
            trigger_policy: TriggerPolicy::Coalesce,
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_feeds: config.max_concurrent_feeds.max(1),
            retry: RetryPolicy::from_config(config),
            trigger_policy: config.trigger_policy,
        }
    }
}

#[derive(Debug, Default)]
struct RunSlot {
    running: Option<Uuid>,
    queued: bool,
    /// Held by `logout` while it clears the cache.
    exclusive: bool,
}

struct Inner {
    db: Database,
    remote: Arc<dyn RemoteClient>,
    settings: SyncSettings,
    slot: Mutex<RunSlot>,
    state: watch::Sender<SyncState>,
    in_flight: InFlightFlags,
}

impl Inner {
    fn slot(&self) -> std::sync::MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entry point for external triggers (CLI, periodic scheduler) and for
/// user-initiated mutations.
///
/// Cloning is cheap; clones share the run slot and published state.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// Marks the run slot as taken for one pass.
///
/// Dropped without [`finish`](RunGuard::finish) (the trigger future was
/// cancelled) it frees the slot and publishes a cancelled result.
struct RunGuard<'a> {
    inner: &'a Inner,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn start(inner: &'a Inner, slot: &mut RunSlot) -> Self {
        let session_id = Uuid::new_v4();
        let started_at = Utc::now();
        slot.running = Some(session_id);
        inner.state.send_replace(SyncState::Running {
            session_id,
            started_at,
        });
        Self {
            inner,
            session_id,
            started_at,
            finished: false,
        }
    }

    /// Publish `result` and free the slot, or hand it to the queued pass.
    fn finish(mut self, result: Arc<SessionResult>) -> Option<RunGuard<'a>> {
        self.finished = true;
        let inner = self.inner;
        let mut slot = inner.slot();
        if slot.queued {
            slot.queued = false;
            tracing::debug!(after = %self.session_id, "Starting queued sync pass");
            return Some(RunGuard::start(inner, &mut slot));
        }
        slot.running = None;
        inner.state.send_replace(SyncState::Idle { last: Some(result) });
        None
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(session_id = %self.session_id, "Sync pass cancelled");
        let cancelled = SessionResult {
            session_id: self.session_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            feeds: None,
            pending: Default::default(),
            outcomes: Vec::new(),
            status: SessionStatus::Failed("cancelled".to_string()),
        };
        let mut slot = self.inner.slot();
        slot.running = None;
        slot.queued = false;
        self.inner.state.send_replace(SyncState::Idle {
            last: Some(Arc::new(cancelled)),
        });
    }
}

/// Holds the slot against passes while the cache is cleared.
struct ExclusiveGuard<'a> {
    inner: &'a Inner,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.slot().exclusive = false;
    }
}

impl SyncOrchestrator {
    pub fn new(db: Database, remote: Arc<dyn RemoteClient>, settings: SyncSettings) -> Self {
        let (state, _) = watch::channel(SyncState::Idle { last: None });
        Self {
            inner: Arc::new(Inner {
                db,
                remote,
                settings,
                slot: Mutex::new(RunSlot::default()),
                state,
                in_flight: InFlightFlags::default(),
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn settings(&self) -> SyncSettings {
        self.inner.settings
    }

    pub fn current_state(&self) -> SyncState {
        self.inner.state.borrow().clone()
    }

    /// Receive every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    // ========================================================================
    // Sync passes
    // ========================================================================

    /// Run a sync pass now.
    ///
    /// While another pass is running the trigger is either coalesced into it
    /// or queued to run once afterwards, per [`TriggerPolicy`]. A queued pass
    /// runs inside the call that owns the running one, which then returns the
    /// last pass's result.
    ///
    /// Dropping the returned future cancels the pass: in-flight requests are
    /// abandoned, open transactions roll back and the state returns to idle.
    pub async fn trigger_sync(&self) -> TriggerResult {
        let mut guard = {
            let mut slot = self.inner.slot();
            let running = slot.running;
            match running {
                Some(running) if self.inner.settings.trigger_policy == TriggerPolicy::Queue => {
                    slot.queued = true;
                    tracing::debug!(behind = %running, "Sync trigger queued");
                    return TriggerResult::Queued { behind: running };
                }
                Some(running) => {
                    tracing::debug!(running = %running, "Sync trigger coalesced into running pass");
                    return TriggerResult::Coalesced { running };
                }
                None if slot.exclusive => {
                    // Logout is clearing the cache; a pass now would refill it
                    tracing::debug!("Sync trigger ignored during logout");
                    drop(slot);
                    return TriggerResult::Ran(Arc::new(self.refused_session()));
                }
                None => RunGuard::start(&self.inner, &mut slot),
            }
        };

        loop {
            let result = Arc::new(self.run_pass(guard.session_id, guard.started_at).await);
            match guard.finish(Arc::clone(&result)) {
                Some(next) => guard = next,
                None => return TriggerResult::Ran(result),
            }
        }
    }

    /// Trigger a pass every `interval` until the future is dropped.
    pub async fn run_periodic(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.trigger_sync().await {
                TriggerResult::Ran(result) => tracing::debug!(
                    session_id = %result.session_id,
                    success = result.is_success(),
                    "Periodic sync finished"
                ),
                other => tracing::debug!(?other, "Periodic sync skipped"),
            }
        }
    }

    fn refused_session(&self) -> SessionResult {
        let now = Utc::now();
        SessionResult {
            session_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            feeds: None,
            pending: Default::default(),
            outcomes: Vec::new(),
            status: SessionStatus::Failed("logout in progress".to_string()),
        }
    }

    async fn run_pass(&self, session_id: Uuid, started_at: DateTime<Utc>) -> SessionResult {
        tracing::info!(
            session_id = %session_id,
            backend = %self.inner.remote.backend(),
            "Sync pass started"
        );

        let mut result = SessionResult {
            session_id,
            started_at,
            finished_at: started_at,
            feeds: None,
            pending: Default::default(),
            outcomes: Vec::new(),
            status: SessionStatus::Success,
        };

        if let Err(e) = self.run_steps(&mut result).await {
            tracing::error!(session_id = %session_id, error = %e, kind = ?e.kind(), "Sync pass failed");
            result.status = SessionStatus::Failed(e.to_string());
        }
        result.finished_at = Utc::now();

        tracing::info!(
            session_id = %session_id,
            success = result.is_success(),
            synced = result.synced_feeds().len(),
            failed = result.failed_feeds().len(),
            vanished = result.vanished_feeds().len(),
            elapsed_ms = (result.finished_at - result.started_at).num_milliseconds(),
            "Sync pass finished"
        );
        result
    }

    /// Pending replay, then the feed step, then the entry step. Every step
    /// commits on its own, so an error here keeps what came before it.
    async fn run_steps(&self, result: &mut SessionResult) -> Result<(), SyncError> {
        let inner = &*self.inner;
        let remote = &*inner.remote;
        let retry = inner.settings.retry;

        result.pending = replay_pending_flags(remote, &inner.db, &retry, &inner.in_flight).await?;
        result.feeds = Some(sync_feeds(remote, &inner.db, &retry).await?);

        let feeds = inner.db.get_feeds().await?;
        let per_feed: Vec<(String, Result<EntrySyncStats, SyncError>)> = stream::iter(feeds)
            .map(|feed: Feed| {
                let remote = Arc::clone(&inner.remote);
                let db = inner.db.clone();
                async move {
                    let outcome = sync_feed_entries(&*remote, &db, &retry, &feed.id).await;
                    (feed.id, outcome)
                }
            })
            .buffer_unordered(inner.settings.max_concurrent_feeds.max(1))
            .collect()
            .await;

        let mut fatal = None;
        for (feed_id, outcome) in per_feed {
            let outcome = match outcome {
                Err(SyncError::Remote(RemoteError::NotFound(_))) => {
                    tracing::info!(feed_id = %feed_id, "Feed vanished remotely, removing it");
                    match inner.db.delete_feed(&feed_id).await {
                        Ok(_) => None,
                        Err(e) => Some(Err(SyncError::from(e))),
                    }
                }
                other => Some(other),
            };
            let feed_result = match outcome {
                None => FeedResult::Vanished,
                Some(Ok(stats)) => FeedResult::Synced(stats),
                Some(Err(e)) => {
                    tracing::warn!(feed_id = %feed_id, error = %e, "Entry sync failed for feed");
                    let failed = FeedResult::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    };
                    if e.is_pass_fatal() && fatal.is_none() {
                        fatal = Some(e);
                    }
                    failed
                }
            };
            result.outcomes.push(FeedOutcome {
                feed_id,
                result: feed_result,
            });
        }
        result.outcomes.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // User-initiated mutations: remote first, local cache on success
    // ========================================================================

    /// Subscribe to `url` and cache the feed the remote created.
    pub async fn add_feed(&self, url: &str) -> Result<Feed, SyncError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SyncError::InvalidInput("feed URL is empty".to_string()));
        }

        let created = self.inner.remote.add_feed(url).await?;
        self.inner.db.upsert_feed(&created).await?;
        tracing::info!(feed_id = %created.id, url = %url, "Feed added");

        self.inner
            .db
            .get_feed(&created.id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("feed {}", created.id)))
    }

    /// Rename a feed. The title is trimmed and stripped of control characters.
    pub async fn rename_feed(&self, feed_id: &str, title: &str) -> Result<(), SyncError> {
        let title = normalize_title(title)
            .ok_or_else(|| SyncError::InvalidInput("feed title is empty".to_string()))?;
        if self.inner.db.get_feed(feed_id).await?.is_none() {
            return Err(SyncError::NotFound(format!("feed {feed_id}")));
        }

        self.inner.remote.rename_feed(feed_id, &title).await?;
        self.inner.db.update_feed_title(feed_id, &title).await?;
        tracing::info!(feed_id = %feed_id, title = %title, "Feed renamed");
        Ok(())
    }

    /// Unsubscribe. A feed the remote no longer knows is still removed locally.
    /// Cached entries of the feed are kept.
    pub async fn delete_feed(&self, feed_id: &str) -> Result<(), SyncError> {
        let remote_missing = match self.inner.remote.delete_feed(feed_id).await {
            Ok(()) => false,
            Err(RemoteError::NotFound(_)) => true,
            Err(e) => return Err(e.into()),
        };

        let removed = self.inner.db.delete_feed(feed_id).await?;
        if remote_missing && !removed {
            return Err(SyncError::NotFound(format!("feed {feed_id}")));
        }
        tracing::info!(feed_id = %feed_id, "Feed deleted");
        Ok(())
    }

    /// Mark an entry read/unread or starred/unstarred.
    ///
    /// The change is recorded as pending before the remote call, so reads and
    /// concurrent sync passes already see it. It is committed when the remote
    /// accepts and dropped when the remote refuses. If this future is dropped
    /// mid-call the change stays pending and the next pass re-sends it.
    pub async fn set_entry_flag(&self, entry_id: &str, flag: EntryFlag, value: bool) -> Result<(), SyncError> {
        let inner = &*self.inner;
        let _in_flight = inner.in_flight.claim(entry_id, flag).ok_or_else(|| SyncError::Conflict {
            entry_id: entry_id.to_string(),
            flag,
        })?;

        inner.db.begin_pending_flag(entry_id, flag, value).await?;

        match inner.remote.set_entry_flag(entry_id, flag, value).await {
            Ok(()) => {
                inner.db.ack_pending_flag(entry_id, flag).await?;
                tracing::debug!(entry_id = %entry_id, flag = %flag, value, "Entry flag updated");
                Ok(())
            }
            Err(e) => {
                inner.db.fail_pending_flag(entry_id, flag).await?;
                tracing::warn!(entry_id = %entry_id, flag = %flag, error = %e, "Remote refused entry flag change");
                Err(e.into())
            }
        }
    }

    /// Update local-only display preferences. Nothing is sent to the remote.
    pub async fn set_feed_preferences(
        &self,
        feed_id: &str,
        open_entries_in_browser: Option<bool>,
        blocked_words: Option<&str>,
    ) -> Result<Feed, SyncError> {
        self.inner
            .db
            .set_feed_preferences(feed_id, open_entries_in_browser, blocked_words)
            .await?;
        self.inner
            .db
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("feed {feed_id}")))
    }

    /// Clear the whole local cache. Refused while a pass is running.
    pub async fn logout(&self) -> Result<(), SyncError> {
        let inner = &*self.inner;
        let _exclusive = {
            let mut slot = inner.slot();
            if slot.running.is_some() || slot.exclusive {
                return Err(SyncError::PassRunning);
            }
            slot.exclusive = true;
            ExclusiveGuard { inner }
        };

        inner.db.clear_all().await?;
        inner.state.send_replace(SyncState::Idle { last: None });
        Ok(())
    }
}

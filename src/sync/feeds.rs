//! Feed-list reconciliation.
//!
//! The feed table is replaced wholesale whenever the remote id set differs
//! from the cached one. Local-only fields ride along by id.

use std::collections::{BTreeSet, HashMap};

use super::error::SyncError;
use super::retry::RetryPolicy;
use crate::remote::RemoteClient;
use crate::storage::{Database, Feed, RemoteFeed};

/// What a feed pass has to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedChangeSet {
    /// Same ids on both sides; nothing is written.
    NoOp,
    /// Replace the cached set with `feeds`.
    Replace {
        feeds: Vec<Feed>,
        /// Remote ids with no cached counterpart, sorted.
        added: Vec<String>,
        /// Cached ids absent remotely, sorted.
        removed: Vec<String>,
    },
}

/// Outcome of the feed step of a pass, kept on the session result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedPassSummary {
    pub replaced: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub total: usize,
}

/// Compare the remote feed list against the cache.
///
/// Order does not matter on either side. When the id sets differ every
/// remote feed is carried into the replacement with `open_entries_in_browser`
/// and `blocked_words` copied from the cached feed of the same id, or
/// `false`/empty for new feeds.
pub fn reconcile(remote: &[RemoteFeed], cached: &[Feed]) -> FeedChangeSet {
    let remote_ids: BTreeSet<&str> = remote.iter().map(|f| f.id.as_str()).collect();
    let cached_ids: BTreeSet<&str> = cached.iter().map(|f| f.id.as_str()).collect();

    if remote_ids == cached_ids {
        return FeedChangeSet::NoOp;
    }

    let local: HashMap<&str, &Feed> = cached.iter().map(|f| (f.id.as_str(), f)).collect();

    let mut seen = BTreeSet::new();
    let feeds = remote
        .iter()
        // A server listing the same id twice would violate the primary key
        .filter(|f| seen.insert(f.id.as_str()))
        .map(|f| match local.get(f.id.as_str()) {
            Some(old) => Feed::from_remote(f.clone(), old.open_entries_in_browser, old.blocked_words.clone()),
            None => Feed::from_remote(f.clone(), false, String::new()),
        })
        .collect();

    FeedChangeSet::Replace {
        feeds,
        added: remote_ids.difference(&cached_ids).map(|s| s.to_string()).collect(),
        removed: cached_ids.difference(&remote_ids).map(|s| s.to_string()).collect(),
    }
}

/// Write a change set. `NoOp` touches nothing.
pub async fn apply(db: &Database, changes: FeedChangeSet) -> Result<FeedPassSummary, SyncError> {
    match changes {
        FeedChangeSet::NoOp => Ok(FeedPassSummary::default()),
        FeedChangeSet::Replace { feeds, added, removed } => {
            db.replace_feeds(&feeds).await?;
            tracing::info!(
                total = feeds.len(),
                added = added.len(),
                removed = removed.len(),
                "Replaced cached feed list"
            );
            Ok(FeedPassSummary {
                replaced: true,
                added,
                removed,
                total: feeds.len(),
            })
        }
    }
}

/// Fetch the remote feed list and reconcile the cache against it.
///
/// A failed fetch returns before the cache is read or written.
pub async fn sync_feeds(
    remote: &dyn RemoteClient,
    db: &Database,
    retry: &RetryPolicy,
) -> Result<FeedPassSummary, SyncError> {
    let remote_feeds = retry.run("list_feeds", || remote.list_feeds()).await?;
    let cached = db.get_feeds().await?;

    let mut summary = apply(db, reconcile(&remote_feeds, &cached)).await?;
    if !summary.replaced {
        summary.total = cached.len();
        tracing::debug!(total = cached.len(), "Feed list unchanged");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn remote(id: &str, title: &str) -> RemoteFeed {
        RemoteFeed {
            id: id.to_string(),
            title: title.to_string(),
            self_link: format!("https://example.com/{id}.xml"),
            alternate_link: None,
        }
    }

    fn cached(id: &str, title: &str, open: bool, blocked: &str) -> Feed {
        Feed::from_remote(remote(id, title), open, blocked.to_string())
    }

    #[test]
    fn test_same_ids_any_order_is_noop() {
        let remote_feeds = vec![remote("2", "B"), remote("1", "A renamed")];
        let cached_feeds = vec![cached("1", "A", true, "spam"), cached("2", "B", false, "")];
        assert_eq!(reconcile(&remote_feeds, &cached_feeds), FeedChangeSet::NoOp);
    }

    #[test]
    fn test_added_feed_triggers_replace_with_carry_forward() {
        let remote_feeds = vec![remote("1", "A"), remote("2", "B")];
        let cached_feeds = vec![cached("1", "A", false, "spam")];

        let FeedChangeSet::Replace { feeds, added, removed } = reconcile(&remote_feeds, &cached_feeds) else {
            panic!("expected a replace");
        };
        assert_eq!(
            feeds,
            vec![cached("1", "A", false, "spam"), cached("2", "B", false, "")]
        );
        assert_eq!(added, vec!["2".to_string()]);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_removed_feed_drops_its_local_fields() {
        let remote_feeds = vec![remote("1", "A")];
        let cached_feeds = vec![cached("1", "A", true, "x"), cached("2", "B", true, "y")];

        let FeedChangeSet::Replace { feeds, removed, .. } = reconcile(&remote_feeds, &cached_feeds) else {
            panic!("expected a replace");
        };
        assert_eq!(feeds, vec![cached("1", "A", true, "x")]);
        assert_eq!(removed, vec!["2".to_string()]);
    }

    #[test]
    fn test_duplicate_remote_ids_are_collapsed() {
        let remote_feeds = vec![remote("1", "A"), remote("1", "A again"), remote("2", "B")];
        let FeedChangeSet::Replace { feeds, .. } = reconcile(&remote_feeds, &[]) else {
            panic!("expected a replace");
        };
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].title, "A");
    }

    #[tokio::test]
    async fn test_apply_noop_writes_nothing() {
        let db = Database::open(":memory:").await.unwrap();
        db.upsert_feed(&remote("1", "A")).await.unwrap();
        db.set_feed_preferences("1", Some(true), Some("spam")).await.unwrap();

        let summary = apply(&db, FeedChangeSet::NoOp).await.unwrap();
        assert!(!summary.replaced);
        assert_eq!(db.get_feeds().await.unwrap(), vec![cached("1", "A", true, "spam")]);
    }

    fn feed_sets() -> impl Strategy<Value = (Vec<(u8, bool, String)>, Vec<u8>)> {
        (
            prop::collection::vec((0u8..20, any::<bool>(), "[a-z]{0,6}"), 0..12),
            prop::collection::vec(0u8..20, 0..12),
        )
    }

    proptest! {
        #[test]
        fn reconcile_is_idempotent((cached_rows, remote_ids) in feed_sets()) {
            let cached_feeds: Vec<Feed> = dedup(cached_rows)
                .into_iter()
                .map(|(id, open, words)| cached(&id.to_string(), "t", open, &words))
                .collect();
            let remote_feeds: Vec<RemoteFeed> = remote_ids
                .iter()
                .map(|id| remote(&id.to_string(), "t"))
                .collect();

            let after = match reconcile(&remote_feeds, &cached_feeds) {
                FeedChangeSet::NoOp => cached_feeds.clone(),
                FeedChangeSet::Replace { feeds, .. } => feeds,
            };
            prop_assert_eq!(reconcile(&remote_feeds, &after), FeedChangeSet::NoOp);
        }

        #[test]
        fn reconcile_preserves_local_fields((cached_rows, remote_ids) in feed_sets()) {
            let cached_feeds: Vec<Feed> = dedup(cached_rows)
                .into_iter()
                .map(|(id, open, words)| cached(&id.to_string(), "old", open, &words))
                .collect();
            let remote_feeds: Vec<RemoteFeed> = remote_ids
                .iter()
                .map(|id| remote(&id.to_string(), "new"))
                .collect();

            if let FeedChangeSet::Replace { feeds, .. } = reconcile(&remote_feeds, &cached_feeds) {
                for feed in &feeds {
                    match cached_feeds.iter().find(|c| c.id == feed.id) {
                        Some(old) => {
                            prop_assert_eq!(feed.open_entries_in_browser, old.open_entries_in_browser);
                            prop_assert_eq!(&feed.blocked_words, &old.blocked_words);
                        }
                        None => {
                            prop_assert!(!feed.open_entries_in_browser);
                            prop_assert!(feed.blocked_words.is_empty());
                        }
                    }
                }
                let ids: BTreeSet<&str> = feeds.iter().map(|f| f.id.as_str()).collect();
                let expected: BTreeSet<String> = remote_ids.iter().map(|id| id.to_string()).collect();
                prop_assert_eq!(ids.len(), expected.len());
            }
        }
    }

    fn dedup(rows: Vec<(u8, bool, String)>) -> Vec<(u8, bool, String)> {
        let mut seen = BTreeSet::new();
        rows.into_iter().filter(|(id, _, _)| seen.insert(*id)).collect()
    }
}

//! Scripted in-process remote for orchestrator tests.
//!
//! Feeds and entries live in memory. Individual calls can be made to fail
//! or to block on a gate until the test releases them.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

use newsync::config::{BackendKind, TriggerPolicy};
use newsync::remote::{EntryPage, RemoteClient, RemoteError};
use newsync::storage::{Database, EntryFlag, RemoteEntry, RemoteFeed};
use newsync::sync::{RetryPolicy, SyncOrchestrator, SyncSettings};

/// Failure a scripted call reports. `RemoteError` is not `Clone`, so the
/// script stores this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Timeout,
    Auth,
    NotFound,
    Status(u16),
}

impl Failure {
    fn to_error(self, what: &str) -> RemoteError {
        match self {
            Failure::Timeout => RemoteError::Timeout,
            Failure::Auth => RemoteError::Auth,
            Failure::NotFound => RemoteError::NotFound(what.to_string()),
            Failure::Status(code) => RemoteError::HttpStatus(code),
        }
    }
}

/// Blocks a call until the test releases it.
pub struct Gate {
    entered: Notify,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    /// Wait until a call reaches the gate.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` blocked (or future) calls through.
    pub fn open(&self, n: usize) {
        self.release.add_permits(n);
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

#[derive(Default)]
struct Script {
    feeds: Vec<RemoteFeed>,
    entries: HashMap<String, Vec<RemoteEntry>>,
    failures: HashMap<String, Failure>,
    nth_failures: HashMap<String, (usize, Failure)>,
    calls: Vec<String>,
    next_id: u32,
}

#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
    page_size: usize,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            page_size: 2,
            ..Default::default()
        })
    }

    pub fn set_feeds(&self, feeds: &[(&str, &str)]) {
        self.script.lock().unwrap().feeds = feeds.iter().map(|(id, title)| feed(id, title)).collect();
    }

    pub fn set_entries(&self, feed_id: &str, entries: Vec<RemoteEntry>) {
        self.script
            .lock()
            .unwrap()
            .entries
            .insert(feed_id.to_string(), entries);
    }

    /// Make every call named `op` (optionally for one id, as `op:id`) fail.
    pub fn fail(&self, key: &str, failure: Failure) {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(key.to_string(), failure);
    }

    /// Make only the `n`th call (counting from 1) with this key fail.
    pub fn fail_nth(&self, key: &str, n: usize, failure: Failure) {
        self.script
            .lock()
            .unwrap()
            .nth_failures
            .insert(key.to_string(), (n, failure));
    }

    pub fn clear_failures(&self) {
        let mut script = self.script.lock().unwrap();
        script.failures.clear();
        script.nth_failures.clear();
    }

    /// Install a gate on every call named `op`.
    pub fn gate(&self, op: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::new());
        self.gates
            .lock()
            .unwrap()
            .insert(op.to_string(), Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.split(':').next() == Some(op)).count()
    }

    /// Record the call, wait on its gate, then report a scripted failure.
    async fn enter(&self, op: &str, id: Option<&str>) -> Result<(), RemoteError> {
        let key = match id {
            Some(id) => format!("{op}:{id}"),
            None => op.to_string(),
        };
        self.script.lock().unwrap().calls.push(key.clone());

        let gate = self.gates.lock().unwrap().get(op).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let script = self.script.lock().unwrap();
        let seen = script.calls.iter().filter(|c| **c == key).count();
        let nth = script
            .nth_failures
            .get(&key)
            .filter(|(n, _)| *n == seen)
            .map(|(_, failure)| *failure);
        let failure = script
            .failures
            .get(&key)
            .or_else(|| script.failures.get(op))
            .copied()
            .or(nth);
        match failure {
            Some(failure) => Err(failure.to_error(&key)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemote {
    fn backend(&self) -> BackendKind {
        BackendKind::Nextcloud
    }

    async fn list_feeds(&self) -> Result<Vec<RemoteFeed>, RemoteError> {
        self.enter("list_feeds", None).await?;
        Ok(self.script.lock().unwrap().feeds.clone())
    }

    async fn add_feed(&self, url: &str) -> Result<RemoteFeed, RemoteError> {
        self.enter("add_feed", None).await?;
        let mut script = self.script.lock().unwrap();
        script.next_id += 1;
        let created = RemoteFeed {
            id: format!("new{}", script.next_id),
            title: format!("Feed at {url}"),
            self_link: url.to_string(),
            alternate_link: None,
        };
        script.feeds.push(created.clone());
        Ok(created)
    }

    async fn rename_feed(&self, feed_id: &str, title: &str) -> Result<(), RemoteError> {
        self.enter("rename_feed", Some(feed_id)).await?;
        let mut script = self.script.lock().unwrap();
        match script.feeds.iter_mut().find(|f| f.id == feed_id) {
            Some(feed) => {
                feed.title = title.to_string();
                Ok(())
            }
            None => Err(RemoteError::NotFound(format!("feed {feed_id}"))),
        }
    }

    async fn delete_feed(&self, feed_id: &str) -> Result<(), RemoteError> {
        self.enter("delete_feed", Some(feed_id)).await?;
        let mut script = self.script.lock().unwrap();
        let before = script.feeds.len();
        script.feeds.retain(|f| f.id != feed_id);
        if script.feeds.len() == before {
            return Err(RemoteError::NotFound(format!("feed {feed_id}")));
        }
        Ok(())
    }

    /// Offset paging: the cursor is the index of the next entry. The page is
    /// read before the gate, like a response already on the wire.
    async fn list_entries(&self, feed_id: &str, cursor: Option<&str>) -> Result<EntryPage, RemoteError> {
        let page = {
            let script = self.script.lock().unwrap();
            script.entries.get(feed_id).map(|all| {
                let start = cursor
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(all.len());
                let end = (start + self.page_size).min(all.len());
                EntryPage {
                    entries: all[start..end].to_vec(),
                    next_cursor: Some(end.to_string()),
                    has_more: end < all.len(),
                }
            })
        };
        self.enter("list_entries", Some(feed_id)).await?;
        page.ok_or_else(|| RemoteError::NotFound(format!("feed {feed_id}")))
    }

    async fn set_entry_flag(&self, entry_id: &str, flag: EntryFlag, value: bool) -> Result<(), RemoteError> {
        self.enter("set_entry_flag", Some(entry_id)).await?;
        let mut script = self.script.lock().unwrap();
        let entry = script
            .entries
            .values_mut()
            .flatten()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| RemoteError::NotFound(format!("entry {entry_id}")))?;
        match flag {
            EntryFlag::Read => entry.read = value,
            EntryFlag::Starred => entry.starred = value,
        }
        Ok(())
    }
}

pub fn feed(id: &str, title: &str) -> RemoteFeed {
    RemoteFeed {
        id: id.to_string(),
        title: title.to_string(),
        self_link: format!("https://example.com/{id}.xml"),
        alternate_link: Some(format!("https://example.com/{id}")),
    }
}

pub fn entry(feed_id: &str, id: &str, read: bool) -> RemoteEntry {
    RemoteEntry {
        id: id.to_string(),
        feed_id: feed_id.to_string(),
        title: format!("Entry {id}"),
        link: Some(format!("https://example.com/{feed_id}/{id}")),
        author: None,
        published: Some(1_700_000_000),
        updated: None,
        summary: Some(format!("Summary of {id}")),
        read,
        starred: false,
        enclosures: Vec::new(),
    }
}

pub fn settings(policy: TriggerPolicy) -> SyncSettings {
    SyncSettings {
        max_concurrent_feeds: 2,
        retry: RetryPolicy::none(),
        trigger_policy: policy,
    }
}

pub async fn setup(policy: TriggerPolicy) -> (Arc<ScriptedRemote>, SyncOrchestrator) {
    let db = Database::open(":memory:").await.unwrap();
    let remote = ScriptedRemote::new();
    let orchestrator = SyncOrchestrator::new(db, remote.clone(), settings(policy));
    (remote, orchestrator)
}

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of newsync appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// The referenced feed or entry is not in the local cache
    #[error("Not found in cache: {0}")]
    NotFound(String),

    /// A flag mutation for this entry is already waiting for remote acknowledgement
    #[error("Entry {entry_id} already has a pending {flag} change")]
    PendingMutation { entry_id: String, flag: EntryFlag },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Remote Records
// ============================================================================

/// A feed as reported by the remote service.
///
/// Carries no local-only fields; those are attached when the record is
/// written to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFeed {
    pub id: String,
    pub title: String,
    pub self_link: String,
    pub alternate_link: Option<String>,
}

/// An entry as reported by the remote service, flags included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub summary: Option<String>,
    pub read: bool,
    pub starred: bool,
    pub enclosures: Vec<Enclosure>,
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from the local cache
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Feed {
    pub id: String,
    pub title: String,
    pub self_link: String,
    pub alternate_link: Option<String>,
    /// Local-only: open entries of this feed in the browser instead of the reader
    pub open_entries_in_browser: bool,
    /// Local-only: newline or comma separated words hiding matching entries
    pub blocked_words: String,
}

impl Feed {
    /// Build a cache record from a remote feed and the local-only fields to attach.
    pub fn from_remote(remote: RemoteFeed, open_entries_in_browser: bool, blocked_words: String) -> Self {
        Self {
            id: remote.id,
            title: remote.title,
            self_link: remote.self_link,
            alternate_link: remote.alternate_link,
            open_entries_in_browser,
            blocked_words,
        }
    }

    /// Individual blocked words, trimmed, empty items dropped.
    pub fn blocked_words_list(&self) -> Vec<&str> {
        self.blocked_words
            .split(['\n', ','])
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .collect()
    }

    /// True if `text` contains any blocked word (case-insensitive).
    pub fn blocks(&self, text: &str) -> bool {
        let words = self.blocked_words_list();
        if words.is_empty() {
            return false;
        }
        let haystack = text.to_lowercase();
        words
            .iter()
            .any(|w| haystack.contains(&w.to_lowercase()))
    }
}

/// Media attached to an entry (podcast audio, images, ...)
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Enclosure {
    pub url: String,
    pub mime_type: Option<String>,
    pub length: Option<i64>,
}

/// Entry data from the local cache.
///
/// `read` and `starred` are effective values: a pending local mutation
/// overrides the last value committed from the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub summary: Option<String>,
    pub read: bool,
    pub starred: bool,
    pub fetched_at: i64,
    pub enclosures: Vec<Enclosure>,
}

/// Internal row type for Entry queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: String,
    pub feed_id: String,
    pub title: String,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub summary: Option<String>,
    pub read: bool,
    pub starred: bool,
    pub fetched_at: i64,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self, enclosures: Vec<Enclosure>) -> Entry {
        Entry {
            id: self.id,
            feed_id: self.feed_id,
            title: self.title,
            link: self.link,
            author: self.author,
            published: self.published,
            updated: self.updated,
            summary: self.summary,
            read: self.read,
            starred: self.starred,
            fetched_at: self.fetched_at,
            enclosures,
        }
    }
}

/// Enclosure row tagged with its owning entry (batch loads)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EnclosureRow {
    pub entry_id: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub length: Option<i64>,
}

/// User-mutable entry flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryFlag {
    Read,
    Starred,
}

impl EntryFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryFlag::Read => "read",
            EntryFlag::Starred => "starred",
        }
    }
}

impl fmt::Display for EntryFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(EntryFlag::Read),
            "starred" => Ok(EntryFlag::Starred),
            other => Err(format!("unknown entry flag: {other}")),
        }
    }
}

/// A flag change sent to the remote and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFlag {
    pub entry_id: String,
    pub flag: EntryFlag,
    pub value: bool,
    pub created_at: i64,
}

/// Counters from merging one entry batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMerge {
    /// Entries seen for the first time
    pub inserted: usize,
    /// Entries already cached whose metadata and flags were refreshed
    pub updated: usize,
    /// Entries whose remote flag contradicts a pending local mutation
    pub conflicts: usize,
}

impl BatchMerge {
    pub fn absorb(&mut self, other: BatchMerge) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.conflicts += other.conflicts;
    }
}

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// Local cache of feeds, entries and sync bookkeeping.
///
/// Cloning is cheap: clones share the connection pool and the writer lock.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    /// Serializes write transactions. A feed-set replace and a user
    /// mutation's local update never interleave; the later one waits.
    pub(crate) writer: Arc<Mutex<()>>,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another instance of newsync
    /// has the database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Other` for other database errors.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Set database file permissions BEFORE pool creation
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for another process's lock.
        // Foreign keys are per-connection, so they are set here for every pooled connection.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All migrations use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Feeds: server-assigned (or hash-derived) string ids.
        // open_entries_in_browser and blocked_words are never sent to the remote.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                self_link TEXT NOT NULL,
                alternate_link TEXT,
                open_entries_in_browser INTEGER NOT NULL DEFAULT 0,
                blocked_words TEXT NOT NULL DEFAULT ''
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Entries deliberately carry no foreign key to feeds: a feed-set
        // replace deletes and re-inserts every feed row and must not cascade.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id TEXT PRIMARY KEY NOT NULL,
                feed_id TEXT NOT NULL,
                title TEXT NOT NULL,
                link TEXT,
                author TEXT,
                published INTEGER,
                updated INTEGER,
                summary TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                starred INTEGER NOT NULL DEFAULT 0,
                fetched_at INTEGER NOT NULL,
                read_acked_seq INTEGER NOT NULL DEFAULT 0,
                starred_acked_seq INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Bumped by every acknowledged flag change. Entries record the value
        // at their last ack per flag, so a page fetched earlier can be told
        // apart from one fetched after the ack.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flag_ack_seq (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                seq INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO flag_ack_seq (id, seq) VALUES (1, 0)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_enclosures (
                entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                url TEXT NOT NULL,
                mime_type TEXT,
                length INTEGER,
                PRIMARY KEY (entry_id, position)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // At most one unacknowledged change per (entry, flag)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_flags (
                entry_id TEXT NOT NULL,
                flag TEXT NOT NULL CHECK (flag IN ('read', 'starred')),
                value INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (entry_id, flag)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Backend-defined resume token per feed
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cursors (
                feed_id TEXT PRIMARY KEY NOT NULL,
                cursor TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed ON entries(feed_id)")
            .execute(&mut *tx)
            .await?;

        // Covers get_entries_for_feed(): WHERE feed_id = ? ORDER BY published DESC
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON entries(feed_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_feed_read ON entries(feed_id, read)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

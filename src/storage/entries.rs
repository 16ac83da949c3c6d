use std::collections::HashMap;

use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{BatchMerge, DatabaseError, Enclosure, EnclosureRow, Entry, EntryDbRow, RemoteEntry};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of entries to return from any single query (OOM protection)
const MAX_ENTRIES: i64 = 2000;

/// Keeps IN (...) lists well under SQLite's 999 parameter limit
const ID_CHUNK: usize = 500;

/// Entry columns with effective flags: a pending mutation overrides the
/// committed value until it is acknowledged or dropped.
const ENTRY_SELECT: &str = r#"
    SELECT e.id, e.feed_id, e.title, e.link, e.author, e.published, e.updated, e.summary,
           COALESCE(pr.value, e.read) AS read,
           COALESCE(ps.value, e.starred) AS starred,
           e.fetched_at
    FROM entries e
    LEFT JOIN pending_flags pr ON pr.entry_id = e.id AND pr.flag = 'read'
    LEFT JOIN pending_flags ps ON ps.entry_id = e.id AND ps.flag = 'starred'
"#;

impl Database {
    // ========================================================================
    // Entry Merge
    // ========================================================================

    /// Merge one batch of remote entries in a single transaction.
    ///
    /// - Unseen entries are inserted with default flags (unread, unstarred),
    ///   then overlaid with the flags reported in this batch.
    /// - Metadata and committed flags of known entries are refreshed. Pending
    ///   local mutations are not touched; they keep precedence through the
    ///   effective-flag view.
    /// - Enclosures are replaced wholesale.
    /// - `cursor`, when given, is saved for `feed_id` in the same transaction
    ///   so an interrupted backlog resumes after this batch.
    pub async fn merge_entry_batch(
        &self,
        feed_id: &str,
        entries: &[RemoteEntry],
        cursor: Option<&str>,
    ) -> Result<BatchMerge, DatabaseError> {
        self.merge_fetched_batch(feed_id, entries, cursor, i64::MAX).await
    }

    /// [`merge_entry_batch`](Self::merge_entry_batch) for a batch fetched
    /// when [`flag_ack_watermark`](Self::flag_ack_watermark) returned
    /// `watermark`. A flag acknowledged after that keeps its committed value.
    pub async fn merge_fetched_batch(
        &self,
        feed_id: &str,
        entries: &[RemoteEntry],
        cursor: Option<&str>,
        watermark: i64,
    ) -> Result<BatchMerge, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut merge = BatchMerge::default();

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        // Pending intents touching this batch, for conflict accounting
        let mut pending: HashMap<(String, String), bool> = HashMap::new();
        for chunk in entries.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT entry_id, flag, value FROM pending_flags WHERE entry_id IN (",
            );
            let mut separated = builder.separated(", ");
            for entry in chunk {
                separated.push_bind(&entry.id);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String, String, bool)> =
                builder.build_query_as().fetch_all(&mut *tx).await?;
            for (entry_id, flag, value) in rows {
                pending.insert((entry_id, flag), value);
            }
        }

        for entry in entries {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO entries (id, feed_id, title, fetched_at, read, starred)
                VALUES (?, ?, ?, ?, 0, 0)
            "#,
            )
            .bind(&entry.id)
            .bind(&entry.feed_id)
            .bind(&entry.title)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted > 0 {
                merge.inserted += 1;
            } else {
                merge.updated += 1;
            }

            sqlx::query(
                r#"
                UPDATE entries SET
                    feed_id = ?, title = ?, link = ?, author = ?, published = ?,
                    updated = ?, summary = ?,
                    read = CASE WHEN read_acked_seq > ? THEN read ELSE ? END,
                    starred = CASE WHEN starred_acked_seq > ? THEN starred ELSE ? END
                WHERE id = ?
            "#,
            )
            .bind(&entry.feed_id)
            .bind(&entry.title)
            .bind(&entry.link)
            .bind(&entry.author)
            .bind(entry.published)
            .bind(entry.updated)
            .bind(&entry.summary)
            .bind(watermark)
            .bind(entry.read)
            .bind(watermark)
            .bind(entry.starred)
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM entry_enclosures WHERE entry_id = ?")
                .bind(&entry.id)
                .execute(&mut *tx)
                .await?;

            if !entry.enclosures.is_empty() {
                let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                    "INSERT INTO entry_enclosures (entry_id, position, url, mime_type, length) ",
                );
                builder.push_values(
                    entry.enclosures.iter().enumerate(),
                    |mut b, (position, enclosure)| {
                        b.push_bind(&entry.id)
                            .push_bind(position as i64)
                            .push_bind(&enclosure.url)
                            .push_bind(&enclosure.mime_type)
                            .push_bind(enclosure.length);
                    },
                );
                builder.build().execute(&mut *tx).await?;
            }

            let contradicts = |flag: &str, remote: bool| {
                pending
                    .get(&(entry.id.clone(), flag.to_string()))
                    .is_some_and(|&intent| intent != remote)
            };
            if contradicts("read", entry.read) || contradicts("starred", entry.starred) {
                merge.conflicts += 1;
            }
        }

        if let Some(cursor) = cursor {
            sqlx::query(
                r#"
                INSERT INTO feed_cursors (feed_id, cursor, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(feed_id) DO UPDATE SET
                    cursor = excluded.cursor,
                    updated_at = excluded.updated_at
            "#,
            )
            .bind(feed_id)
            .bind(cursor)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            feed_id = %feed_id,
            inserted = merge.inserted,
            updated = merge.updated,
            conflicts = merge.conflicts,
            "Merged entry batch"
        );

        Ok(merge)
    }

    /// Saved resume token for a feed's entry fetch
    pub async fn get_entry_cursor(&self, feed_id: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT cursor FROM feed_cursors WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(cursor,)| cursor))
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Get cached entries of a feed, newest first, with enclosures.
    pub async fn get_entries_for_feed(
        &self,
        feed_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let filter = if unread_only {
            "AND COALESCE(pr.value, e.read) = 0"
        } else {
            ""
        };
        let rows = sqlx::query_as::<_, EntryDbRow>(&format!(
            "{ENTRY_SELECT} WHERE e.feed_id = ? {filter}
             ORDER BY e.published DESC, e.fetched_at DESC, e.id
             LIMIT ?"
        ))
        .bind(feed_id)
        .bind(MAX_ENTRIES)
        .fetch_all(&self.pool)
        .await?;

        self.attach_enclosures(rows).await
    }

    /// Entries of a feed with the feed's blocked words applied to titles
    /// and summaries.
    pub async fn get_visible_entries(
        &self,
        feed_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let feed = self
            .get_feed(feed_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("feed {feed_id}")))?;
        let entries = self.get_entries_for_feed(feed_id, unread_only).await?;

        Ok(entries
            .into_iter()
            .filter(|e| !feed.blocks(&e.title) && !e.summary.as_deref().is_some_and(|s| feed.blocks(s)))
            .collect())
    }

    /// Get a single cached entry
    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<Entry>, DatabaseError> {
        let row = sqlx::query_as::<_, EntryDbRow>(&format!("{ENTRY_SELECT} WHERE e.id = ?"))
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.attach_enclosures(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Committed (remote-acknowledged) flags of cached entries, keyed by id.
    /// Ids that are not cached are absent.
    pub async fn get_committed_flags(
        &self,
        entry_ids: &[String],
    ) -> Result<HashMap<String, (bool, bool)>, DatabaseError> {
        let mut flags = HashMap::with_capacity(entry_ids.len());

        for chunk in entry_ids.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("SELECT id, read, starred FROM entries WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");

            let rows: Vec<(String, bool, bool)> =
                builder.build_query_as().fetch_all(&self.pool).await?;
            for (id, read, starred) in rows {
                flags.insert(id, (read, starred));
            }
        }

        Ok(flags)
    }

    async fn attach_enclosures(&self, rows: Vec<EntryDbRow>) -> Result<Vec<Entry>, DatabaseError> {
        let mut by_entry: HashMap<String, Vec<Enclosure>> = HashMap::new();

        for chunk in rows.chunks(ID_CHUNK) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "SELECT entry_id, url, mime_type, length FROM entry_enclosures WHERE entry_id IN (",
            );
            let mut separated = builder.separated(", ");
            for row in chunk {
                separated.push_bind(&row.id);
            }
            separated.push_unseparated(") ORDER BY entry_id, position");

            let enclosures: Vec<EnclosureRow> =
                builder.build_query_as().fetch_all(&self.pool).await?;
            for e in enclosures {
                by_entry.entry(e.entry_id).or_default().push(Enclosure {
                    url: e.url,
                    mime_type: e.mime_type,
                    length: e.length,
                });
            }
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let enclosures = by_entry.remove(&row.id).unwrap_or_default();
                row.into_entry(enclosures)
            })
            .collect())
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Drop every cached record (feeds, entries, enclosures, pending
    /// mutations, cursors) in one transaction.
    pub async fn clear_all(&self) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        for table in ["entry_enclosures", "entries", "pending_flags", "feed_cursors", "feeds"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::info!("Local cache cleared");
        Ok(())
    }
}

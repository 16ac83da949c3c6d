use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, Feed, RemoteFeed};

const FEED_COLUMNS: &str =
    "id, title, self_link, alternate_link, open_entries_in_browser, blocked_words";

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    /// Get all cached feeds ordered by title
    pub async fn get_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feeds = sqlx::query_as::<_, Feed>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// Get a single cached feed
    pub async fn get_feed(&self, feed_id: &str) -> Result<Option<Feed>, DatabaseError> {
        let feed =
            sqlx::query_as::<_, Feed>(&format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"))
                .bind(feed_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(feed)
    }

    /// Unread entry count per feed, honouring pending read mutations.
    ///
    /// Feeds without unread entries are absent from the result.
    pub async fn get_unread_counts(&self) -> Result<Vec<(String, i64)>, DatabaseError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT e.feed_id, COUNT(*)
            FROM entries e
            LEFT JOIN pending_flags p ON p.entry_id = e.id AND p.flag = 'read'
            WHERE COALESCE(p.value, e.read) = 0
            GROUP BY e.feed_id
            ORDER BY e.feed_id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Feed Writes
    // ========================================================================

    /// Insert a feed freshly created on the remote, or refresh its remote
    /// attributes if it is already cached. Local-only fields are kept.
    pub async fn upsert_feed(&self, feed: &RemoteFeed) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        sqlx::query(
            r#"
            INSERT INTO feeds (id, title, self_link, alternate_link)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                self_link = excluded.self_link,
                alternate_link = excluded.alternate_link
        "#,
        )
        .bind(&feed.id)
        .bind(&feed.title)
        .bind(&feed.self_link)
        .bind(&feed.alternate_link)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the whole feed table with `feeds` in a single transaction.
    ///
    /// Callers are responsible for attaching local-only fields before the
    /// call. Cursors of feeds that are no longer present are dropped in the
    /// same transaction. Any failure rolls back to the previous feed set.
    ///
    /// PERF-001: Batch INSERT in chunks of 100.
    pub async fn replace_feeds(&self, feeds: &[Feed]) -> Result<(), DatabaseError> {
        const BATCH_SIZE: usize = 100;

        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM feeds").execute(&mut *tx).await?;

        for chunk in feeds.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new(format!("INSERT INTO feeds ({FEED_COLUMNS}) "));

            builder.push_values(chunk, |mut b, feed| {
                b.push_bind(&feed.id)
                    .push_bind(&feed.title)
                    .push_bind(&feed.self_link)
                    .push_bind(&feed.alternate_link)
                    .push_bind(feed.open_entries_in_browser)
                    .push_bind(&feed.blocked_words);
            });

            builder.build().execute(&mut *tx).await?;
        }

        sqlx::query("DELETE FROM feed_cursors WHERE feed_id NOT IN (SELECT id FROM feeds)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Rename a cached feed
    ///
    /// # Errors
    ///
    /// `DatabaseError::NotFound` if the feed is not cached (for instance
    /// because a concurrent sync pass removed it).
    pub async fn update_feed_title(&self, feed_id: &str, title: &str) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("UPDATE feeds SET title = ? WHERE id = ?")
            .bind(title)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("feed {feed_id}")));
        }
        Ok(())
    }

    /// Delete a cached feed together with its local-only fields and cursor.
    ///
    /// Entries of the feed stay cached. Returns whether a feed row was removed.
    pub async fn delete_feed(&self, feed_id: &str) -> Result<bool, DatabaseError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feed_cursors WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    /// Update local-only display preferences. `None` leaves a field unchanged.
    pub async fn set_feed_preferences(
        &self,
        feed_id: &str,
        open_entries_in_browser: Option<bool>,
        blocked_words: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE feeds SET
                open_entries_in_browser = COALESCE(?, open_entries_in_browser),
                blocked_words = COALESCE(?, blocked_words)
            WHERE id = ?
        "#,
        )
        .bind(open_entries_in_browser)
        .bind(blocked_words)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("feed {feed_id}")));
        }
        Ok(())
    }
}

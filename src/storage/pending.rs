use super::schema::Database;
use super::types::{DatabaseError, EntryFlag, PendingFlag};

impl Database {
    // ========================================================================
    // Pending Flag Mutations
    // ========================================================================

    /// Record a user's intent to change a flag before it is sent to the remote.
    ///
    /// From here until [`ack_pending_flag`](Self::ack_pending_flag) or
    /// [`fail_pending_flag`](Self::fail_pending_flag), reads of the entry
    /// report `value` and sync passes cannot override it.
    ///
    /// # Errors
    ///
    /// - `DatabaseError::NotFound` if the entry is not cached
    /// - `DatabaseError::PendingMutation` if the same flag already has an
    ///   unacknowledged change
    pub async fn begin_pending_flag(
        &self,
        entry_id: &str,
        flag: EntryFlag,
        value: bool,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM entries WHERE id = ?")
            .bind(entry_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DatabaseError::NotFound(format!("entry {entry_id}")));
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO pending_flags (entry_id, flag, value, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(entry_id)
        .bind(flag.as_str())
        .bind(value)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            return Err(DatabaseError::PendingMutation {
                entry_id: entry_id.to_string(),
                flag,
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// The remote accepted the change: commit the pending value into the
    /// entry and drop the pending row, atomically.
    ///
    /// Returns `false` if there was no pending row (already resolved).
    pub async fn ack_pending_flag(&self, entry_id: &str, flag: EntryFlag) -> Result<bool, DatabaseError> {
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let pending: Option<(bool,)> =
            sqlx::query_as("SELECT value FROM pending_flags WHERE entry_id = ? AND flag = ?")
                .bind(entry_id)
                .bind(flag.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        let Some((value,)) = pending else {
            return Ok(false);
        };

        sqlx::query("UPDATE flag_ack_seq SET seq = seq + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        let update = match flag {
            EntryFlag::Read => {
                "UPDATE entries SET read = ?, read_acked_seq = (SELECT seq FROM flag_ack_seq WHERE id = 1) WHERE id = ?"
            }
            EntryFlag::Starred => {
                "UPDATE entries SET starred = ?, starred_acked_seq = (SELECT seq FROM flag_ack_seq WHERE id = 1) WHERE id = ?"
            }
        };
        sqlx::query(update)
            .bind(value)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pending_flags WHERE entry_id = ? AND flag = ?")
            .bind(entry_id)
            .bind(flag.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Sequence number of the most recent acknowledged flag change.
    ///
    /// Read it before fetching a page and hand it to
    /// [`merge_fetched_batch`](Self::merge_fetched_batch), so acks that land
    /// while the page is in flight are not undone by it.
    pub async fn flag_ack_watermark(&self) -> Result<i64, DatabaseError> {
        let (seq,): (i64,) = sqlx::query_as("SELECT seq FROM flag_ack_seq WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    /// The remote rejected the change: drop the pending row so the entry
    /// reverts to the last committed value.
    pub async fn fail_pending_flag(&self, entry_id: &str, flag: EntryFlag) -> Result<bool, DatabaseError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM pending_flags WHERE entry_id = ? AND flag = ?")
            .bind(entry_id)
            .bind(flag.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All unacknowledged flag changes, oldest first
    pub async fn get_pending_flags(&self) -> Result<Vec<PendingFlag>, DatabaseError> {
        let rows: Vec<(String, String, bool, i64)> = sqlx::query_as(
            "SELECT entry_id, flag, value, created_at FROM pending_flags ORDER BY created_at, entry_id, flag",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending = Vec::with_capacity(rows.len());
        for (entry_id, flag, value, created_at) in rows {
            // The CHECK constraint keeps other spellings out of the table
            match flag.parse::<EntryFlag>() {
                Ok(flag) => pending.push(PendingFlag {
                    entry_id,
                    flag,
                    value,
                    created_at,
                }),
                Err(e) => tracing::warn!(entry_id = %entry_id, error = %e, "Skipping pending flag"),
            }
        }
        Ok(pending)
    }
}

//! Message and message-queue queries.

use taskflow_core::db::unix_timestamp_ms;

use super::db::{Database, DatabaseError};
use super::models::{
    Message, MessageRow, NewMessage, QueueMetadata, QueuedMessage, QueuedMessageRow,
};

impl Database {
    // =========================================================================
    // Message queries
    // =========================================================================

    /// Append a message to a session, assigning the next session-wide index.
    pub async fn append_message(&self, new: &NewMessage) -> Result<Message, DatabaseError> {
        let now = unix_timestamp_ms();
        let content = serde_json::to_string(&new.content)?;

        let mut tx = self.pool().begin().await?;

        let next_index: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(idx), -1) + 1 FROM messages WHERE session_id = ?",
        )
        .bind(&new.session_id)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query(
            r"
            INSERT INTO messages (session_id, task_id, idx, role, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&new.session_id)
        .bind(new.task_id.as_deref())
        .bind(next_index)
        .bind(new.role.as_str())
        .bind(&content)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Message {
            id: result.last_insert_rowid(),
            session_id: new.session_id.clone(),
            task_id: new.task_id.clone(),
            index: next_index,
            role: new.role,
            content: new.content.clone(),
            created_at: now,
        })
    }

    /// Messages produced by one task, in index order.
    pub async fn list_task_messages(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<Message>, DatabaseError> {
        sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE session_id = ? AND task_id = ? ORDER BY idx ASC",
        )
        .bind(session_id)
        .bind(task_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Message::try_from)
        .collect()
    }

    // =========================================================================
    // Queue queries
    // =========================================================================

    /// Append a prompt to a session's queue. Returns the queue entry id.
    pub async fn enqueue_message(
        &self,
        session_id: &str,
        content: &str,
        metadata: &QueueMetadata,
    ) -> Result<i64, DatabaseError> {
        let now = unix_timestamp_ms();
        let metadata = serde_json::to_string(metadata)?;

        let result = sqlx::query(
            "INSERT INTO queued_messages (session_id, content, metadata, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(content)
        .bind(metadata)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Oldest pending entry of a session's queue, left in place.
    pub async fn next_queued_message(
        &self,
        session_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError> {
        sqlx::query_as::<_, QueuedMessageRow>(
            r"
            SELECT id, session_id, content, metadata, created_at FROM queued_messages
            WHERE session_id = ? AND status = 'pending'
            ORDER BY id ASC LIMIT 1
            ",
        )
        .bind(session_id)
        .fetch_optional(self.pool())
        .await?
        .map(QueuedMessage::try_from)
        .transpose()
    }

    /// Take a queue entry off the pending list.
    pub async fn mark_queued_delivered(&self, id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE queued_messages SET status = 'delivered' WHERE id = ? AND status = 'pending'",
        )
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Pending queue entry {id}")));
        }
        Ok(())
    }

    /// Pending entries of a session's queue, oldest first.
    pub async fn list_queued_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<QueuedMessage>, DatabaseError> {
        sqlx::query_as::<_, QueuedMessageRow>(
            r"
            SELECT id, session_id, content, metadata, created_at FROM queued_messages
            WHERE session_id = ? AND status = 'pending'
            ORDER BY id ASC
            ",
        )
        .bind(session_id)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(QueuedMessage::try_from)
        .collect()
    }
}

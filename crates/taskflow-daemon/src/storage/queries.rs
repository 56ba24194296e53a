//! Session and task queries.

use taskflow_core::db::unix_timestamp_ms;

use super::db::{Database, DatabaseError};
use super::models::{
    NewSession, NewTask, Session, SessionPatch, SessionRow, Task, TaskPatch, TaskRow, TaskStatus,
};

impl Database {
    // =========================================================================
    // Session queries
    // =========================================================================

    /// Create a new idle session that is ready for a prompt.
    pub async fn create_session(&self, new: &NewSession) -> Result<Session, DatabaseError> {
        let now = unix_timestamp_ms();
        let callback_config = new
            .callback_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO sessions
                (id, parent_session_id, callback_config, created_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&new.id)
        .bind(new.parent_session_id.as_deref())
        .bind(callback_config)
        .bind(new.created_by.as_deref())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_session(&new.id).await
    }

    /// Get a session by ID, including its ordered task list.
    pub async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {id}")))?;

        let tasks = sqlx::query_scalar::<_, String>(
            "SELECT id FROM tasks WHERE session_id = ? ORDER BY rowid ASC",
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;

        row.into_session(tasks)
    }

    /// Apply a partial update to a session in a single statement.
    pub async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<(), DatabaseError> {
        let now = unix_timestamp_ms();
        let callback_config = patch
            .callback_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r"
            UPDATE sessions SET
                status = COALESCE(?, status),
                ready_for_prompt = COALESCE(?, ready_for_prompt),
                callback_config = COALESCE(?, callback_config),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.ready_for_prompt.map(i64::from))
        .bind(callback_config)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Session {id}")));
        }
        Ok(())
    }

    /// Delete a session; its tasks, messages and queue cascade.
    pub async fn delete_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Task queries
    // =========================================================================

    /// Insert a pending task. Insertion order makes it the session's latest.
    pub async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO tasks (id, session_id, status, description, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&new.id)
        .bind(&new.session_id)
        .bind(TaskStatus::Pending.as_str())
        .bind(&new.description)
        .bind(new.created_by.as_deref())
        .bind(new.created_at)
        .execute(self.pool())
        .await?;

        self.get_task(&new.id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<Task, DatabaseError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))?
            .try_into()
    }

    /// Apply a partial update to a task and return the stored result.
    ///
    /// Each column is last-write-wins; absent fields keep their value.
    pub async fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError> {
        let range = &patch.message_range;
        let result = sqlx::query(
            r"
            UPDATE tasks SET
                status = COALESCE(?, status),
                started_at = COALESCE(?, started_at),
                completed_at = COALESCE(?, completed_at),
                duration_ms = COALESCE(?, duration_ms),
                msg_start_index = COALESCE(?, msg_start_index),
                msg_end_index = COALESCE(?, msg_end_index),
                msg_start_timestamp = COALESCE(?, msg_start_timestamp),
                msg_end_timestamp = COALESCE(?, msg_end_timestamp),
                tool_use_count = COALESCE(?, tool_use_count),
                report = COALESCE(?, report),
                error = COALESCE(?, error)
            WHERE id = ?
            ",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .bind(patch.duration_ms)
        .bind(range.start_index)
        .bind(range.end_index)
        .bind(range.start_timestamp)
        .bind(range.end_timestamp)
        .bind(patch.tool_use_count)
        .bind(patch.report.as_deref())
        .bind(patch.error.as_deref())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {id}")));
        }
        self.get_task(id).await
    }

    /// List tasks whose status is one of `statuses`, oldest first.
    pub async fn list_tasks_with_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM tasks WHERE status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(") ORDER BY rowid ASC");

        builder
            .build_query_as::<TaskRow>()
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(Task::try_from)
            .collect()
    }
}

//! Storage seam used by the orchestration core.
//!
//! The core never talks to [`Database`] directly so that alternative stores
//! (or fault-injecting wrappers in tests) can be plugged in.

use async_trait::async_trait;

use super::db::{Database, DatabaseError};
use super::models::{
    Message, NewMessage, NewSession, NewTask, QueueMetadata, QueuedMessage, Session, SessionPatch,
    Task, TaskPatch, TaskStatus,
};

/// Task/session/message/queue store with per-field partial updates.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, new: &NewSession) -> Result<Session, DatabaseError>;
    async fn get_session(&self, id: &str) -> Result<Session, DatabaseError>;
    async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<(), DatabaseError>;

    async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError>;
    async fn get_task(&self, id: &str) -> Result<Task, DatabaseError>;
    async fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError>;
    async fn list_tasks_with_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError>;

    async fn append_message(&self, new: &NewMessage) -> Result<Message, DatabaseError>;
    async fn list_task_messages(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<Message>, DatabaseError>;

    async fn enqueue_message(
        &self,
        session_id: &str,
        content: &str,
        metadata: &QueueMetadata,
    ) -> Result<i64, DatabaseError>;
    /// Oldest pending queue entry; it stays pending until marked delivered.
    async fn next_queued_message(
        &self,
        session_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError>;
    async fn mark_queued_delivered(&self, id: i64) -> Result<(), DatabaseError>;
}

#[async_trait]
impl Store for Database {
    async fn create_session(&self, new: &NewSession) -> Result<Session, DatabaseError> {
        Self::create_session(self, new).await
    }

    async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        Self::get_session(self, id).await
    }

    async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<(), DatabaseError> {
        Self::patch_session(self, id, patch).await
    }

    async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError> {
        Self::create_task(self, new).await
    }

    async fn get_task(&self, id: &str) -> Result<Task, DatabaseError> {
        Self::get_task(self, id).await
    }

    async fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError> {
        Self::patch_task(self, id, patch).await
    }

    async fn list_tasks_with_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError> {
        Self::list_tasks_with_status(self, statuses).await
    }

    async fn append_message(&self, new: &NewMessage) -> Result<Message, DatabaseError> {
        Self::append_message(self, new).await
    }

    async fn list_task_messages(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<Message>, DatabaseError> {
        Self::list_task_messages(self, session_id, task_id).await
    }

    async fn enqueue_message(
        &self,
        session_id: &str,
        content: &str,
        metadata: &QueueMetadata,
    ) -> Result<i64, DatabaseError> {
        Self::enqueue_message(self, session_id, content, metadata).await
    }

    async fn next_queued_message(
        &self,
        session_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError> {
        Self::next_queued_message(self, session_id).await
    }

    async fn mark_queued_delivered(&self, id: i64) -> Result<(), DatabaseError> {
        Self::mark_queued_delivered(self, id).await
    }
}

//! Task lifecycle manager.
//!
//! Owns every write to a task. Writes to one task are serialized through a
//! per-task lock held across read, compute, write and session reflection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use taskflow_core::db::unix_timestamp_ms;

use super::timing::{apply_terminal_timing, stamp_started, strip_terminal_timing};
use crate::callback::CallbackRouter;
use crate::storage::{
    DatabaseError, Message, MessageRange, NewTask, Session, SessionPatch, SessionStatus, Store,
    Task, TaskPatch, TaskStatus,
};

/// Errors from task lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Task {task_id} is already {status} and cannot become {requested}")]
    AlreadyTerminal {
        task_id: String,
        status: TaskStatus,
        requested: TaskStatus,
    },
}

/// Drives task state transitions and reflects them onto the owning session.
pub struct TaskLifecycle {
    store: Arc<dyn Store>,
    router: Option<Arc<CallbackRouter>>,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            router: None,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Forward terminal transitions of child tasks to `router`.
    #[must_use]
    pub fn with_router(mut self, router: Arc<CallbackRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Insert a pending task; it becomes the session's latest.
    pub async fn create(
        &self,
        session_id: &str,
        description: &str,
        created_by: Option<&str>,
    ) -> Result<Task, LifecycleError> {
        let task = self
            .store
            .create_task(&NewTask {
                id: uuid::Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                description: description.to_string(),
                created_by: created_by.map(String::from),
                created_at: unix_timestamp_ms(),
            })
            .await?;
        debug!(session_id, task_id = %task.id, "Task created");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, LifecycleError> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Move a task to `status`, applying `fields` on the way.
    ///
    /// Re-patching a terminal task with a terminal status is allowed (for
    /// instance to attach a report) but keeps its stored status and timing
    /// and leaves the session alone. A terminal task cannot go back to a
    /// non-terminal status.
    pub async fn transition(
        &self,
        task_id: &str,
        status: TaskStatus,
        fields: TaskPatch,
    ) -> Result<Task, LifecycleError> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.lock().await;

        let current = self.store.get_task(task_id).await?;
        let repatch = current.status.is_terminal();
        if repatch && !status.is_terminal() {
            return Err(LifecycleError::AlreadyTerminal {
                task_id: task_id.to_string(),
                status: current.status,
                requested: status,
            });
        }

        let mut patch = fields;
        let now = unix_timestamp_ms();

        if repatch {
            if status != current.status {
                debug!(
                    task_id,
                    status = %current.status,
                    requested = %status,
                    "Task already finished, keeping its status"
                );
            }
            patch.status = Some(current.status);
            strip_terminal_timing(&mut patch);
        } else {
            patch.status = Some(status);
            if status.is_terminal() {
                apply_terminal_timing(&current, &mut patch, now);
            } else if status == TaskStatus::Running {
                stamp_started(&current, &mut patch, now);
            }
        }

        let task = self.store.patch_task(task_id, &patch).await?;
        if repatch {
            return Ok(task);
        }
        let session = self.reflect_on_session(&task, status).await;
        drop(guard);

        if status.is_terminal() {
            info!(
                session_id = %task.session_id,
                task_id,
                status = %status,
                duration_ms = ?task.duration_ms,
                "Task finished"
            );
            if let (Some(router), Some(session)) = (&self.router, session) {
                router.route(&task, &session).await;
            }
        }

        Ok(task)
    }

    /// Fold a persisted message into the task's message range and tool count.
    pub async fn record_message(
        &self,
        task_id: &str,
        message: &Message,
    ) -> Result<Task, LifecycleError> {
        let lock = self.task_lock(task_id).await;
        let _guard = lock.lock().await;

        let current = self.store.get_task(task_id).await?;
        if current.status.is_terminal() {
            debug!(task_id, "Ignoring message for finished task");
            return Ok(current);
        }

        let range = &current.message_range;
        let patch = TaskPatch {
            message_range: MessageRange {
                start_index: range.start_index.or(Some(message.index)),
                end_index: Some(message.index),
                start_timestamp: range.start_timestamp.or(Some(message.created_at)),
                end_timestamp: Some(message.created_at),
            },
            tool_use_count: Some(current.tool_use_count + message.tool_use_count()),
            ..Default::default()
        };

        Ok(self.store.patch_task(task_id, &patch).await?)
    }

    /// Drop the write lock of a finished task.
    pub async fn forget(&self, task_id: &str) {
        let mut locks = self.task_locks.lock().await;
        if locks
            .get(task_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(task_id);
        }
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.task_locks
                .lock()
                .await
                .entry(task_id.to_string())
                .or_default(),
        )
    }

    /// Best-effort session status update. Returns the session when it could
    /// be loaded so terminal transitions can be routed.
    async fn reflect_on_session(&self, task: &Task, status: TaskStatus) -> Option<Session> {
        let session = match self.store.get_session(&task.session_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    session_id = %task.session_id,
                    task_id = %task.id,
                    error = %e,
                    "Failed to load session for task transition"
                );
                return None;
            }
        };

        if !session.is_latest_task(&task.id) {
            debug!(
                session_id = %session.id,
                task_id = %task.id,
                latest = ?session.latest_task_id(),
                "Stale task, session status left untouched"
            );
            return Some(session);
        }

        let patch = match status {
            TaskStatus::Pending => return Some(session),
            TaskStatus::Running => SessionPatch {
                status: Some(SessionStatus::Running),
                ready_for_prompt: Some(false),
                ..Default::default()
            },
            TaskStatus::AwaitingPermission => SessionPatch {
                status: Some(SessionStatus::AwaitingPermission),
                ..Default::default()
            },
            TaskStatus::Completed | TaskStatus::Failed => SessionPatch {
                status: Some(SessionStatus::Idle),
                ready_for_prompt: Some(true),
                ..Default::default()
            },
            // The stop flow owns `ready_for_prompt`.
            TaskStatus::Stopped => SessionPatch {
                status: Some(SessionStatus::Idle),
                ..Default::default()
            },
        };

        if let Err(e) = self.store.patch_session(&session.id, &patch).await {
            warn!(
                session_id = %session.id,
                task_id = %task.id,
                error = %e,
                "Failed to reflect task status on session"
            );
        }
        Some(session)
    }
}

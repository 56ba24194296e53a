//! Shared helpers for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use taskflow_daemon::backend::{
    AgentBackend, BackendError, BackendEvent, Invocation, InvocationContext, InvocationHandle,
};
use taskflow_daemon::callback::{QueueTrigger, TriggerOptions};
use taskflow_daemon::permission::PermissionDecision;
use taskflow_daemon::storage::{
    Database, DatabaseError, Message, MessageRole, NewMessage, NewSession, NewTask, QueueMetadata,
    QueuedMessage, Session, SessionPatch, Store, Task, TaskPatch, TaskStatus,
};

// =========================================================================
// Scripted backend
// =========================================================================

/// Backend that replays a fixed list of events per invocation.
///
/// After a `permission_request` the stream waits for the answer and ends on
/// a denial. With `hang` set the stream stays silent after the script until
/// cancelled, like a long-running tool. With `refuse_cancel` set every cancel
/// call fails and the stream keeps going.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Vec<BackendEvent>,
    hang: AtomicBool,
    refuse_cancel: Arc<AtomicBool>,
    pub invocations: AtomicUsize,
    pub cancels: Arc<AtomicUsize>,
    pub responses: Arc<Mutex<Vec<(String, bool)>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<BackendEvent>) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn hanging(script: Vec<BackendEvent>) -> Arc<Self> {
        let backend = Self::new(script);
        backend.hang.store(true, Ordering::SeqCst);
        backend
    }

    /// Later invocations run the script to completion.
    pub fn stop_hanging(&self) {
        self.hang.store(false, Ordering::SeqCst);
    }

    /// Make every cancel call fail, as a wedged agent would.
    pub fn refuse_cancel(&self, refuse: bool) {
        self.refuse_cancel.store(refuse, Ordering::SeqCst);
    }
}

struct ScriptedHandle {
    cancel: CancellationToken,
    answers: mpsc::UnboundedSender<bool>,
    refuse_cancel: Arc<AtomicBool>,
    cancels: Arc<AtomicUsize>,
    responses: Arc<Mutex<Vec<(String, bool)>>>,
}

#[async_trait]
impl InvocationHandle for ScriptedHandle {
    async fn cancel(&self) -> Result<(), BackendError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.refuse_cancel.load(Ordering::SeqCst) {
            return Err(BackendError::Cancel("agent not responding".to_string()));
        }
        self.cancel.cancel();
        Ok(())
    }

    async fn respond_permission(
        &self,
        tool_call_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), BackendError> {
        self.responses
            .lock()
            .await
            .push((tool_call_id.to_string(), decision.allow));
        self.answers
            .send(decision.allow)
            .map_err(|_| BackendError::Closed)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn invoke(
        &self,
        _ctx: &InvocationContext,
        prompt: &str,
    ) -> Result<Invocation, BackendError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());

        let cancel = CancellationToken::new();
        let (answers, mut answer_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ScriptedHandle {
            cancel: cancel.clone(),
            answers,
            refuse_cancel: Arc::clone(&self.refuse_cancel),
            cancels: Arc::clone(&self.cancels),
            responses: Arc::clone(&self.responses),
        });

        let script = self.script.clone();
        let hang = self.hang.load(Ordering::SeqCst);
        let events = async_stream::stream! {
            for event in script {
                let waits = matches!(event, BackendEvent::PermissionRequest { .. });
                yield Ok::<_, BackendError>(event);
                if waits {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        allow = answer_rx.recv() => {
                            if allow != Some(true) {
                                return;
                            }
                        }
                    }
                }
            }
            if hang {
                cancel.cancelled().await;
            }
        };

        Ok(Invocation {
            events: Box::pin(events),
            handle,
        })
    }
}

pub fn assistant(text: &str) -> BackendEvent {
    BackendEvent::Message {
        role: MessageRole::Assistant,
        content: serde_json::json!([{"type": "text", "text": text}]),
    }
}

pub fn tool_use(name: &str) -> BackendEvent {
    BackendEvent::Message {
        role: MessageRole::Assistant,
        content: serde_json::json!([{"type": "tool_use", "name": name, "input": {}}]),
    }
}

pub fn permission(tool_call_id: &str, tool_name: &str) -> BackendEvent {
    BackendEvent::PermissionRequest {
        tool_call_id: tool_call_id.to_string(),
        tool_name: tool_name.to_string(),
        tool_input: serde_json::json!({"command": "rm -rf build"}),
    }
}

pub fn result(report: &str) -> BackendEvent {
    BackendEvent::Result {
        report: Some(report.to_string()),
        is_error: false,
        error: None,
    }
}

// =========================================================================
// Recording trigger
// =========================================================================

/// Queue trigger that only records its calls.
pub struct RecordingTrigger {
    tx: mpsc::UnboundedSender<(String, TriggerOptions)>,
}

impl RecordingTrigger {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, TriggerOptions)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl QueueTrigger for RecordingTrigger {
    async fn trigger(&self, session_id: &str, options: TriggerOptions) {
        let _ = self.tx.send((session_id.to_string(), options));
    }
}

// =========================================================================
// Fault-injecting store
// =========================================================================

/// Store that delegates to a database but can fail session writes and
/// slow down queue reads.
pub struct FlakyStore {
    pub inner: Database,
    pub fail_session_patch: AtomicBool,
    pub queue_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new(inner: Database) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_session_patch: AtomicBool::new(false),
            queue_delay_ms: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_session(&self, new: &NewSession) -> Result<Session, DatabaseError> {
        self.inner.create_session(new).await
    }

    async fn get_session(&self, id: &str) -> Result<Session, DatabaseError> {
        self.inner.get_session(id).await
    }

    async fn patch_session(&self, id: &str, patch: &SessionPatch) -> Result<(), DatabaseError> {
        if self.fail_session_patch.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("injected failure".to_string()));
        }
        self.inner.patch_session(id, patch).await
    }

    async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError> {
        self.inner.create_task(new).await
    }

    async fn get_task(&self, id: &str) -> Result<Task, DatabaseError> {
        self.inner.get_task(id).await
    }

    async fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<Task, DatabaseError> {
        self.inner.patch_task(id, patch).await
    }

    async fn list_tasks_with_status(
        &self,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, DatabaseError> {
        self.inner.list_tasks_with_status(statuses).await
    }

    async fn append_message(&self, new: &NewMessage) -> Result<Message, DatabaseError> {
        self.inner.append_message(new).await
    }

    async fn list_task_messages(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.inner.list_task_messages(session_id, task_id).await
    }

    async fn enqueue_message(
        &self,
        session_id: &str,
        content: &str,
        metadata: &QueueMetadata,
    ) -> Result<i64, DatabaseError> {
        self.inner.enqueue_message(session_id, content, metadata).await
    }

    async fn next_queued_message(
        &self,
        session_id: &str,
    ) -> Result<Option<QueuedMessage>, DatabaseError> {
        let delay = self.queue_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.next_queued_message(session_id).await
    }

    async fn mark_queued_delivered(&self, id: i64) -> Result<(), DatabaseError> {
        self.inner.mark_queued_delivered(id).await
    }
}

// =========================================================================
// Misc
// =========================================================================

pub async fn memory_db() -> Arc<Database> {
    Arc::new(Database::open_in_memory().await.unwrap())
}

pub fn session(id: &str) -> NewSession {
    NewSession {
        id: id.to_string(),
        created_by: Some("user-1".to_string()),
        ..Default::default()
    }
}

pub fn child_session(id: &str, parent: &str) -> NewSession {
    NewSession {
        id: id.to_string(),
        parent_session_id: Some(parent.to_string()),
        created_by: Some("user-2".to_string()),
        ..Default::default()
    }
}

/// Poll `check` until it returns `Some` or five seconds pass.
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}

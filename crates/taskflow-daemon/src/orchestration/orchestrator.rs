//! The orchestrator: public entry point for prompts, stops and decisions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taskflow_core::db::unix_timestamp_ms;

use super::queue::OrchestratorTrigger;
use super::types::{
    ORPHANED_REASON, OrchestratorConfig, OrchestratorError, RunningInvocation, StopResult,
};
use crate::backend::AgentBackend;
use crate::callback::{CallbackRouter, QueueTrigger, TriggerOptions};
use crate::cancellation::StopFlags;
use crate::permission::{PermissionCoordinator, PermissionDecision, PermissionEvent};
use crate::storage::{
    DatabaseError, NewSession, Session, SessionPatch, Store, Task, TaskPatch, TaskStatus,
};
use crate::task::TaskLifecycle;

/// Bookkeeping for the single live invocation of a session.
pub(super) struct ActiveRun {
    pub task_id: String,
    pub started_at: i64,
    pub cancel: CancellationToken,
    /// Flips to `true` once the run loop has cleaned up.
    pub done: watch::Receiver<bool>,
}

/// Coordinates sessions, tasks, backends, permissions and callbacks.
pub struct Orchestrator {
    pub(super) store: Arc<dyn Store>,
    pub(super) backend: Arc<dyn AgentBackend>,
    pub(super) lifecycle: TaskLifecycle,
    pub(super) permissions: Arc<PermissionCoordinator>,
    pub(super) stop_flags: StopFlags,
    /// Live invocations keyed by session ID.
    pub(super) active: RwLock<HashMap<String, ActiveRun>>,
    /// Serializes queue processing per session.
    pub(super) queue_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub(super) queue_trigger: Arc<dyn QueueTrigger>,
    pub(super) config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn AgentBackend>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let queue_trigger: Arc<dyn QueueTrigger> =
                Arc::new(OrchestratorTrigger::new(weak.clone()));
            let router = Arc::new(CallbackRouter::new(
                Arc::clone(&store),
                Arc::clone(&queue_trigger),
                config.callbacks.clone(),
            ));
            Self {
                lifecycle: TaskLifecycle::new(Arc::clone(&store)).with_router(router),
                permissions: Arc::new(PermissionCoordinator::new(config.permissions.clone())),
                stop_flags: StopFlags::new(),
                active: RwLock::new(HashMap::new()),
                queue_locks: Mutex::new(HashMap::new()),
                queue_trigger,
                store,
                backend,
                config,
            }
        })
    }

    pub fn permissions(&self) -> &Arc<PermissionCoordinator> {
        &self.permissions
    }

    /// Observe permission requests and their resolution.
    pub fn subscribe_permissions(&self) -> broadcast::Receiver<PermissionEvent> {
        self.permissions.subscribe()
    }

    pub async fn create_session(&self, new: NewSession) -> Result<Session, OrchestratorError> {
        Ok(self.store.create_session(&new).await?)
    }

    /// Start a new task in `session_id` running `prompt`.
    ///
    /// Returns the new task's ID once its run loop has been spawned.
    pub async fn submit_prompt(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        created_by: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        match self.store.get_session(session_id).await {
            Ok(_) => {}
            Err(DatabaseError::NotFound(_)) => {
                return Err(OrchestratorError::SessionNotFound {
                    session_id: session_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let mut active = self.active.write().await;
        self.start_run(&mut active, session_id, prompt, created_by).await
    }

    /// Claim `session_id` in the active-run map and spawn its run loop.
    ///
    /// The caller holds the map's write lock, so nothing else can claim the
    /// session between its own checks and the claim.
    pub(super) async fn start_run(
        self: &Arc<Self>,
        active: &mut HashMap<String, ActiveRun>,
        session_id: &str,
        prompt: &str,
        created_by: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        if active.contains_key(session_id) {
            return Err(OrchestratorError::SessionBusy {
                session_id: session_id.to_string(),
            });
        }

        // A flag left by a stop that raced a previous run's cleanup must not
        // cancel this one.
        self.stop_flags.clear(session_id).await;

        let task = self
            .lifecycle
            .create(session_id, prompt, created_by)
            .await?;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        active.insert(
            session_id.to_string(),
            ActiveRun {
                task_id: task.id.clone(),
                started_at: unix_timestamp_ms(),
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        info!(session_id, task_id = %task.id, "Prompt submitted");

        let this = Arc::clone(self);
        let sid = session_id.to_string();
        let tid = task.id.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            this.run_invocation(sid, tid, prompt, cancel, done_tx).await;
        });

        Ok(task.id)
    }

    /// Mark a task completed from outside its run loop.
    pub async fn complete(
        &self,
        task_id: &str,
        report: Option<String>,
    ) -> Result<Task, OrchestratorError> {
        Ok(self
            .lifecycle
            .transition(
                task_id,
                TaskStatus::Completed,
                TaskPatch {
                    report,
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Mark a task failed from outside its run loop.
    pub async fn fail(&self, task_id: &str, error: &str) -> Result<Task, OrchestratorError> {
        Ok(self
            .lifecycle
            .transition(
                task_id,
                TaskStatus::Failed,
                TaskPatch {
                    error: Some(error.to_string()),
                    ..Default::default()
                },
            )
            .await?)
    }

    /// Stop the active invocation of a session.
    ///
    /// Sets the stop flag, cancels pending permission requests and waits for
    /// the run loop to finish. If the backend does not wind down in time the
    /// run loop is cancelled directly and given one more wait. Only once the
    /// run has ended is the session marked ready for the next prompt.
    pub async fn stop(&self, session_id: &str) -> StopResult {
        let run = self
            .active
            .read()
            .await
            .get(session_id)
            .map(|run| (run.done.clone(), run.cancel.clone()));
        let Some((mut done, cancel)) = run else {
            return StopResult::failed("No active invocation");
        };

        self.stop_flags.request_stop(session_id).await;
        let cancelled = self.permissions.cancel_pending_requests(session_id).await;
        info!(session_id, cancelled_permissions = cancelled, "Stopping session");

        let wait = self.config.stop_wait_timeout;
        if tokio::time::timeout(wait, done.wait_for(|finished| *finished))
            .await
            .is_err()
        {
            warn!(
                session_id,
                timeout_secs = wait.as_secs(),
                "Timed out waiting for backend to stop, cancelling run loop"
            );
            cancel.cancel();
            if tokio::time::timeout(wait, done.wait_for(|finished| *finished))
                .await
                .is_err()
            {
                warn!(session_id, "Run loop did not finish after cancellation");
                return StopResult::failed("Timed out waiting for invocation to stop");
            }
        }

        let patch = SessionPatch {
            ready_for_prompt: Some(true),
            ..Default::default()
        };
        if let Err(e) = self.store.patch_session(session_id, &patch).await {
            warn!(session_id, error = %e, "Failed to mark session ready after stop");
            return StopResult::failed(format!("Failed to update session: {e}"));
        }

        self.queue_trigger
            .trigger(session_id, TriggerOptions::from_source("stop"))
            .await;
        StopResult::stopped()
    }

    /// Deliver a permission decision.
    pub async fn decide(&self, decision: PermissionDecision) -> Result<(), OrchestratorError> {
        Ok(self.permissions.decide(decision).await?)
    }

    /// Live invocations.
    pub async fn get_running(&self) -> Vec<RunningInvocation> {
        let mut running: Vec<_> = self
            .active
            .read()
            .await
            .iter()
            .map(|(session_id, run)| RunningInvocation {
                session_id: session_id.clone(),
                task_id: run.task_id.clone(),
                started_at: run.started_at,
            })
            .collect();
        running.sort_by_key(|r| r.started_at);
        running
    }

    /// Tasks that claim to be running but have no live invocation.
    pub async fn get_orphaned(&self) -> Result<Vec<Task>, OrchestratorError> {
        let candidates = self
            .store
            .list_tasks_with_status(&[TaskStatus::Running, TaskStatus::AwaitingPermission])
            .await?;
        let active = self.active.read().await;
        Ok(candidates
            .into_iter()
            .filter(|task| {
                active
                    .get(&task.session_id)
                    .is_none_or(|run| run.task_id != task.id)
            })
            .collect())
    }

    /// Fail every orphaned task. Returns how many were recovered.
    pub async fn recover_orphaned(&self) -> Result<usize, OrchestratorError> {
        let orphaned = self.get_orphaned().await?;
        let mut recovered = 0;
        for task in &orphaned {
            match self.fail(&task.id, ORPHANED_REASON).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "Failed to recover orphaned task"),
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered orphaned tasks");
        }
        Ok(recovered)
    }

    /// Whether the session's run has been asked to stop.
    pub(super) async fn is_stopping(&self, session_id: &str, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.stop_flags.is_stop_requested(session_id).await
    }
}

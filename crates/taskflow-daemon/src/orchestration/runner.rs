//! Per-invocation run loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::orchestrator::Orchestrator;
use super::types::OrchestratorError;
use crate::backend::{BackendEvent, Invocation, InvocationContext, InvocationHandle};
use crate::callback::TriggerOptions;
use crate::cancellation::{CancelGate, monitor};
use crate::storage::{MessageRole, NewMessage, TaskPatch, TaskStatus};

/// How a run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RunOutcome {
    Completed { report: Option<String> },
    Failed { error: String, report: Option<String> },
    Stopped,
}

enum PermissionStep {
    Allowed,
    Denied { reason: String },
}

impl Orchestrator {
    /// Drive one invocation to a terminal task status, then clean up.
    pub(super) async fn run_invocation(
        self: Arc<Self>,
        session_id: String,
        task_id: String,
        prompt: String,
        cancel: CancellationToken,
        done: watch::Sender<bool>,
    ) {
        let outcome = self.drive(&session_id, &task_id, &prompt, &cancel).await;
        info!(session_id = %session_id, task_id = %task_id, ?outcome, "Invocation finished");
        self.finish_task(&task_id, outcome).await;

        self.stop_flags.clear(&session_id).await;
        self.active.write().await.remove(&session_id);
        self.lifecycle.forget(&task_id).await;
        let _ = done.send(true);

        self.queue_trigger
            .trigger(&session_id, TriggerOptions::from_source("invocation_finished"))
            .await;
    }

    async fn drive(
        &self,
        session_id: &str,
        task_id: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if let Err(e) = self
            .lifecycle
            .transition(task_id, TaskStatus::Running, TaskPatch::default())
            .await
        {
            return self.classify_failure(session_id, cancel, e.to_string(), None).await;
        }
        self.persist_message(session_id, task_id, MessageRole::User, prompt.into())
            .await;

        let ctx = InvocationContext::new(session_id, task_id);
        let invocation = tokio::select! {
            biased;
            () = cancel.cancelled() => return RunOutcome::Stopped,
            invocation = self.backend.invoke(&ctx, prompt) => invocation,
        };
        let Invocation {
            mut events,
            handle,
        } = match invocation {
            Ok(invocation) => invocation,
            Err(e) => {
                return self.classify_failure(session_id, cancel, e.to_string(), None).await;
            }
        };

        let gate = CancelGate::new(Arc::clone(&handle));
        let _monitor = monitor::start(
            session_id,
            Arc::clone(&gate),
            self.stop_flags.clone(),
            cancel.clone(),
            self.config.poll_interval,
        );

        let mut report = None;
        let mut failure: Option<String> = None;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = events.next() => next,
            };

            match next {
                None | Some(Ok(BackendEvent::End)) => break,
                Some(Ok(BackendEvent::Message { role, content })) => {
                    self.persist_message(session_id, task_id, role, content).await;
                }
                Some(Ok(BackendEvent::PermissionRequest {
                    tool_call_id,
                    tool_name,
                    tool_input,
                })) => {
                    let step = self
                        .handle_permission(
                            session_id,
                            task_id,
                            &handle,
                            &tool_call_id,
                            &tool_name,
                            tool_input,
                            cancel,
                        )
                        .await;
                    let reason = match step {
                        Ok(PermissionStep::Allowed) => continue,
                        Ok(PermissionStep::Denied { reason }) => {
                            format!("Permission denied for {tool_name}: {reason}")
                        }
                        Err(e) => format!("Permission flow failed for {tool_name}: {e}"),
                    };
                    self.permissions.cancel_pending_requests(session_id).await;
                    if let Err(e) = gate.cancel().await {
                        warn!(session_id, task_id, error = %e, "Failed to cancel backend after denial");
                    }
                    return self.classify_failure(session_id, cancel, reason, report).await;
                }
                Some(Ok(BackendEvent::Result {
                    report: result_report,
                    is_error,
                    error,
                })) => {
                    if result_report.is_some() {
                        report = result_report;
                    }
                    if is_error {
                        failure = Some(error.unwrap_or_else(|| "Agent reported an error".to_string()));
                    }
                }
                Some(Ok(BackendEvent::Unknown)) => {}
                Some(Err(e)) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        match failure {
            Some(error) => self.classify_failure(session_id, cancel, error, report).await,
            None if self.is_stopping(session_id, cancel).await => RunOutcome::Stopped,
            None => RunOutcome::Completed { report },
        }
    }

    /// A stop request always wins over whatever failure it caused.
    async fn classify_failure(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        error: String,
        report: Option<String>,
    ) -> RunOutcome {
        if self.is_stopping(session_id, cancel).await {
            debug!(session_id, error = %error, "Failure during stop treated as stopped");
            RunOutcome::Stopped
        } else {
            RunOutcome::Failed { error, report }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_permission(
        &self,
        session_id: &str,
        task_id: &str,
        handle: &Arc<dyn InvocationHandle>,
        tool_call_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<PermissionStep, OrchestratorError> {
        self.lifecycle
            .transition(task_id, TaskStatus::AwaitingPermission, TaskPatch::default())
            .await?;

        let pending = self
            .permissions
            .request(session_id, task_id, tool_name, tool_input)
            .await;
        let decision = self
            .permissions
            .await_decision(pending, cancel)
            .await
            .into_decision();

        handle.respond_permission(tool_call_id, &decision).await?;

        if decision.allow {
            self.lifecycle
                .transition(task_id, TaskStatus::Running, TaskPatch::default())
                .await?;
            Ok(PermissionStep::Allowed)
        } else {
            Ok(PermissionStep::Denied {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "Denied by user".to_string()),
            })
        }
    }

    async fn persist_message(
        &self,
        session_id: &str,
        task_id: &str,
        role: MessageRole,
        content: serde_json::Value,
    ) {
        let new = NewMessage {
            session_id: session_id.to_string(),
            task_id: Some(task_id.to_string()),
            role,
            content,
        };
        let message = match self.store.append_message(&new).await {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id, task_id, error = %e, "Failed to persist message");
                return;
            }
        };
        if let Err(e) = self.lifecycle.record_message(task_id, &message).await {
            warn!(session_id, task_id, error = %e, "Failed to record message on task");
        }
    }

    /// Write the run's terminal status unless something else already did.
    async fn finish_task(&self, task_id: &str, outcome: RunOutcome) {
        match self.lifecycle.get(task_id).await {
            Ok(task) if task.status.is_terminal() => {
                debug!(task_id, status = %task.status, "Task already finished elsewhere");
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to load task before finishing"),
        }

        let (status, patch) = match outcome {
            RunOutcome::Completed { report } => (
                TaskStatus::Completed,
                TaskPatch {
                    report,
                    ..Default::default()
                },
            ),
            RunOutcome::Failed { error, report } => (
                TaskStatus::Failed,
                TaskPatch {
                    error: Some(error),
                    report,
                    ..Default::default()
                },
            ),
            RunOutcome::Stopped => (TaskStatus::Stopped, TaskPatch::default()),
        };

        if let Err(e) = self.lifecycle.transition(task_id, status, patch).await {
            error!(task_id, error = %e, "Failed to record task outcome");
        }
    }
}

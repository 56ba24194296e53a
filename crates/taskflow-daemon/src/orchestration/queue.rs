//! Queue processing trigger.
//!
//! Drains at most one queued prompt per call into a session that is idle,
//! ready and has no live invocation. Calls for the same session are
//! serialized, so a call that arrives mid-processing re-evaluates once the
//! earlier one is done.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::orchestrator::Orchestrator;
use super::types::OrchestratorError;
use crate::callback::{QueueTrigger, TriggerOptions};
use crate::storage::SessionStatus;

/// [`QueueTrigger`] backed by an orchestrator.
pub struct OrchestratorTrigger {
    orchestrator: Weak<Orchestrator>,
}

impl OrchestratorTrigger {
    pub const fn new(orchestrator: Weak<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl QueueTrigger for OrchestratorTrigger {
    async fn trigger(&self, session_id: &str, options: TriggerOptions) {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.process_queue(session_id, options).await,
            None => debug!(session_id, "Orchestrator gone, queue trigger ignored"),
        }
    }
}

impl Orchestrator {
    /// Process `session_id`'s queue once, waiting for in-flight processing.
    pub async fn process_queue(self: &Arc<Self>, session_id: &str, options: TriggerOptions) {
        let lock = self.queue_lock(session_id).await;
        let _guard = lock.lock().await;

        match self.drain_one(session_id).await {
            Ok(Some(task_id)) => info!(
                session_id,
                task_id = %task_id,
                source = ?options.source,
                "Queued prompt submitted"
            ),
            Ok(None) => {}
            Err(e) => warn!(
                session_id,
                source = ?options.source,
                error = %e,
                "Queue processing failed"
            ),
        }
    }

    async fn drain_one(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        // Held until the queued prompt owns the session, so a direct submit
        // cannot slip in between the checks and the claim.
        let mut active = self.active.write().await;
        if active.contains_key(session_id) {
            debug!(session_id, "Session busy, queue left for later");
            return Ok(None);
        }

        let session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Idle || !session.ready_for_prompt {
            debug!(
                session_id,
                status = %session.status,
                ready_for_prompt = session.ready_for_prompt,
                "Session not ready, queue left for later"
            );
            return Ok(None);
        }

        let Some(entry) = self.store.next_queued_message(session_id).await? else {
            return Ok(None);
        };

        // On failure the entry stays pending for the next trigger.
        let task_id = self
            .start_run(
                &mut active,
                session_id,
                &entry.content,
                entry.metadata.queued_by_user_id.as_deref(),
            )
            .await?;
        drop(active);

        if let Err(e) = self.store.mark_queued_delivered(entry.id).await {
            warn!(
                session_id,
                entry_id = entry.id,
                error = %e,
                "Failed to mark queued prompt delivered"
            );
        }
        Ok(Some(task_id))
    }

    async fn queue_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.queue_locks
                .lock()
                .await
                .entry(session_id.to_string())
                .or_default(),
        )
    }
}

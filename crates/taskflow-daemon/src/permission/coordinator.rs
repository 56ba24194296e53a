//! Permission coordinator.
//!
//! Gates tool invocations behind an external allow/deny decision without
//! blocking anything but the calling flow. Requests are serialized per
//! session: a request is only emitted to observers once it holds its
//! session's slot, and the slot is held until the request resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskflow_core::db::unix_timestamp_ms;

use super::types::{
    DECIDED_BY_GRANT, PermissionDecision, PermissionError, PermissionEvent, PermissionOutcome,
    PermissionRequest, PermissionScope,
};

/// Configuration for the permission coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a request waits for a decision once emitted.
    pub decision_timeout: Duration,
    /// Capacity of the observer broadcast channel.
    pub event_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(5 * 60),
            event_capacity: 256,
        }
    }
}

impl From<&taskflow_core::config::PermissionConfig> for CoordinatorConfig {
    fn from(config: &taskflow_core::config::PermissionConfig) -> Self {
        Self {
            decision_timeout: Duration::from_secs(config.decision_timeout_secs),
            event_capacity: config.event_capacity,
        }
    }
}

struct PendingEntry {
    request: PermissionRequest,
    /// Set once the request holds its session slot and was broadcast.
    emitted: bool,
    tx: oneshot::Sender<PermissionOutcome>,
}

/// A registered request that has not been awaited yet.
///
/// Hand it to [`PermissionCoordinator::await_decision`]; dropping it without
/// awaiting leaves the registry entry until the session is bulk-cancelled.
pub struct PendingPermission {
    request: PermissionRequest,
    rx: oneshot::Receiver<PermissionOutcome>,
    slot: Arc<Mutex<()>>,
}

impl PendingPermission {
    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    pub const fn request(&self) -> &PermissionRequest {
        &self.request
    }
}

/// Correlation-id keyed registry of one-shot decision channels.
pub struct PermissionCoordinator {
    config: CoordinatorConfig,
    /// Pending requests keyed by `request_id`.
    pending: RwLock<HashMap<String, PendingEntry>>,
    /// One slot per session; held for a request's whole lifetime.
    session_slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Remembered decisions: `session_id` -> `tool_name` -> allow.
    grants: RwLock<HashMap<String, HashMap<String, bool>>>,
    events: broadcast::Sender<PermissionEvent>,
}

impl PermissionCoordinator {
    /// Create a new coordinator.
    pub fn new(config: CoordinatorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            pending: RwLock::new(HashMap::new()),
            session_slots: Mutex::new(HashMap::new()),
            grants: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CoordinatorConfig::default())
    }

    /// Subscribe to request/resolution notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    /// Register a permission request for a tool call.
    ///
    /// Nothing is emitted yet: the request becomes observable once
    /// [`Self::await_decision`] acquires the session's slot.
    pub async fn request(
        &self,
        session_id: &str,
        task_id: &str,
        tool_name: &str,
        tool_input: serde_json::Value,
    ) -> PendingPermission {
        let request = PermissionRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_input,
            created_at: unix_timestamp_ms(),
        };
        let (tx, rx) = oneshot::channel();

        self.pending.write().await.insert(
            request.request_id.clone(),
            PendingEntry {
                request: request.clone(),
                emitted: false,
                tx,
            },
        );

        let slot = Arc::clone(
            self.session_slots
                .lock()
                .await
                .entry(session_id.to_string())
                .or_default(),
        );

        debug!(
            session_id,
            task_id,
            tool_name,
            request_id = %request.request_id,
            "Permission request registered"
        );

        PendingPermission { request, rx, slot }
    }

    /// Wait for the request to be resolved.
    ///
    /// Suspends only the calling flow. Resolves with the external decision,
    /// `Cancelled` when `cancel` fires or the session is bulk-cancelled, or
    /// `TimedOut` after the configured window.
    pub async fn await_decision(
        &self,
        pending: PendingPermission,
        cancel: &CancellationToken,
    ) -> PermissionOutcome {
        let PendingPermission {
            request,
            mut rx,
            slot,
        } = pending;
        let request_id = request.request_id.clone();

        // Queue behind any request already holding the session slot.
        let slot_guard = tokio::select! {
            biased;
            outcome = &mut rx => {
                let outcome = outcome.unwrap_or_else(|_| PermissionOutcome::Cancelled {
                    request_id: request_id.clone(),
                });
                return self.finish(&request, outcome).await;
            }
            () = cancel.cancelled() => None,
            guard = slot.lock_owned() => Some(guard),
        };
        let Some(_slot_guard) = slot_guard else {
            return self
                .settle(&request, PermissionOutcome::Cancelled { request_id }, rx)
                .await;
        };

        if let Some(allow) = self
            .session_grant(&request.session_id, &request.tool_name)
            .await
        {
            debug!(request_id = %request_id, allow, "Answered from session grant");
            let decision = PermissionDecision {
                request_id: request_id.clone(),
                allow,
                remember: true,
                scope: PermissionScope::Session,
                decided_by: DECIDED_BY_GRANT.to_string(),
                reason: (!allow).then(|| "Denied by remembered decision".to_string()),
            };
            return self
                .finish(&request, PermissionOutcome::Decided(decision))
                .await;
        }

        let still_pending = {
            let mut pending = self.pending.write().await;
            pending.get_mut(&request_id).map(|entry| entry.emitted = true)
        };
        if still_pending.is_none() {
            // Bulk cancellation won the race against the slot.
            let outcome = rx.try_recv().unwrap_or(PermissionOutcome::Cancelled {
                request_id: request_id.clone(),
            });
            return self.finish(&request, outcome).await;
        }

        let _ = self.events.send(PermissionEvent::Requested(request.clone()));
        info!(
            session_id = %request.session_id,
            task_id = %request.task_id,
            request_id = %request_id,
            tool_name = %request.tool_name,
            "Permission request pending"
        );

        let outcome = tokio::select! {
            outcome = &mut rx => {
                let outcome = outcome.unwrap_or_else(|_| PermissionOutcome::Cancelled {
                    request_id: request_id.clone(),
                });
                return self.finish(&request, outcome).await;
            }
            () = cancel.cancelled() => PermissionOutcome::Cancelled {
                request_id: request_id.clone(),
            },
            () = tokio::time::sleep(self.config.decision_timeout) => {
                warn!(
                    request_id = %request_id,
                    timeout_secs = self.config.decision_timeout.as_secs(),
                    "Permission request timed out"
                );
                PermissionOutcome::TimedOut { request_id: request_id.clone() }
            }
        };

        self.settle(&request, outcome, rx).await
    }

    /// Deliver an external decision.
    pub async fn decide(&self, decision: PermissionDecision) -> Result<(), PermissionError> {
        let entry = {
            let mut pending = self.pending.write().await;
            match pending.get(&decision.request_id) {
                None => {
                    return Err(PermissionError::RequestNotFound {
                        request_id: decision.request_id,
                    });
                }
                Some(entry) if !entry.emitted => {
                    return Err(PermissionError::NotAwaitingDecision {
                        request_id: decision.request_id,
                    });
                }
                Some(_) => pending.remove(&decision.request_id),
            }
        };
        let Some(entry) = entry else {
            return Err(PermissionError::RequestNotFound {
                request_id: decision.request_id,
            });
        };

        if decision.is_session_grant() {
            self.add_session_grant(
                &entry.request.session_id,
                &entry.request.tool_name,
                decision.allow,
            )
            .await;
        }

        info!(
            request_id = %decision.request_id,
            tool_name = %entry.request.tool_name,
            allow = decision.allow,
            decided_by = %decision.decided_by,
            "Permission decision received"
        );

        if entry.tx.send(PermissionOutcome::Decided(decision)).is_err() {
            debug!("Permission waiter already gone");
        }
        Ok(())
    }

    /// Resolve every pending request of a session as cancelled, including
    /// requests still queued behind the session slot.
    pub async fn cancel_pending_requests(&self, session_id: &str) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.request.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = entries.len();
        for entry in entries {
            let request_id = entry.request.request_id;
            let _ = entry
                .tx
                .send(PermissionOutcome::Cancelled { request_id });
        }

        if count > 0 {
            info!(session_id, count, "Cancelled pending permission requests");
        }
        count
    }

    /// Requests of a session that are currently awaiting a decision.
    pub async fn pending_for_session(&self, session_id: &str) -> Vec<PermissionRequest> {
        self.pending
            .read()
            .await
            .values()
            .filter(|e| e.emitted && e.request.session_id == session_id)
            .map(|e| e.request.clone())
            .collect()
    }

    /// Get an emitted request by ID.
    pub async fn get_pending(&self, request_id: &str) -> Option<PermissionRequest> {
        self.pending
            .read()
            .await
            .get(request_id)
            .filter(|e| e.emitted)
            .map(|e| e.request.clone())
    }

    /// Remember a decision for every later request of `tool_name` in a session.
    pub async fn add_session_grant(&self, session_id: &str, tool_name: &str, allow: bool) {
        self.grants
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(tool_name.to_string(), allow);
        debug!(session_id, tool_name, allow, "Added session grant");
    }

    /// Drop remembered grants and an idle session slot.
    pub async fn clear_session(&self, session_id: &str) {
        self.grants.write().await.remove(session_id);

        let mut slots = self.session_slots.lock().await;
        if slots
            .get(session_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(session_id);
        }
        drop(slots);

        debug!(session_id, "Cleared session permission state");
    }

    async fn session_grant(&self, session_id: &str, tool_name: &str) -> Option<bool> {
        self.grants
            .read()
            .await
            .get(session_id)
            .and_then(|tools| tools.get(tool_name).copied())
    }

    /// Resolve with `outcome` unless a decision or bulk cancellation already
    /// claimed the entry, in which case the claimed outcome is delivered.
    async fn settle(
        &self,
        request: &PermissionRequest,
        outcome: PermissionOutcome,
        rx: oneshot::Receiver<PermissionOutcome>,
    ) -> PermissionOutcome {
        let claimed = self
            .pending
            .write()
            .await
            .remove(&request.request_id)
            .is_none();
        let outcome = if claimed {
            // The claimer owns the sender and sends right after removing.
            rx.await.unwrap_or(outcome)
        } else {
            outcome
        };
        self.finish(request, outcome).await
    }

    async fn finish(
        &self,
        request: &PermissionRequest,
        outcome: PermissionOutcome,
    ) -> PermissionOutcome {
        self.pending.write().await.remove(&request.request_id);

        let _ = self.events.send(PermissionEvent::Resolved {
            request_id: request.request_id.clone(),
            session_id: request.session_id.clone(),
            allow: outcome.is_allowed(),
            reason: outcome.reason().map(String::from),
        });
        debug!(
            request_id = %request.request_id,
            allow = outcome.is_allowed(),
            reason = ?outcome.reason(),
            "Permission request resolved"
        );
        outcome
    }
}

//! Queue processing trigger contract.

use async_trait::async_trait;

/// Why a session's queue is being drained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerOptions {
    /// Short label for logs, e.g. `child_task_callback`.
    pub source: Option<String>,
}

impl TriggerOptions {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
        }
    }
}

/// Drains a session's message queue.
///
/// A call made while processing is under way waits for it and then
/// re-evaluates once. Callers never check the session's state first.
#[async_trait]
pub trait QueueTrigger: Send + Sync {
    async fn trigger(&self, session_id: &str, options: TriggerOptions);
}

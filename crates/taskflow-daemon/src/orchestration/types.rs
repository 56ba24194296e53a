//! Orchestrator configuration, results and errors.

use std::time::Duration;

use serde::Serialize;

use taskflow_core::Config;
use taskflow_core::config::CallbackDefaults;

use crate::backend::BackendError;
use crate::cancellation::DEFAULT_POLL_INTERVAL;
use crate::permission::{CoordinatorConfig, PermissionError};
use crate::storage::DatabaseError;
use crate::task::LifecycleError;

/// Failure reason recorded on tasks found without a live invocation.
pub const ORPHANED_REASON: &str = "Orphaned: no live invocation";

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub permissions: CoordinatorConfig,
    /// Stop-flag poll interval of the cancellation monitor.
    pub poll_interval: Duration,
    /// Upper bound on how long `stop` waits for the run loop to finish.
    pub stop_wait_timeout: Duration,
    pub callbacks: CallbackDefaults,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            permissions: CoordinatorConfig::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_wait_timeout: Duration::from_secs(30),
            callbacks: CallbackDefaults::default(),
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            permissions: CoordinatorConfig::from(&config.permissions),
            poll_interval: Duration::from_millis(config.cancellation.poll_interval_ms.max(1)),
            stop_wait_timeout: Duration::from_secs(config.cancellation.stop_wait_timeout_secs),
            callbacks: config.callbacks.clone(),
        }
    }
}

/// A live invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningInvocation {
    pub session_id: String,
    pub task_id: String,
    /// Unix milliseconds.
    pub started_at: i64,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StopResult {
    pub const fn stopped() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

/// Errors from orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session {session_id} already has an active invocation")]
    SessionBusy { session_id: String },

    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_sections() {
        let mut config = Config::default();
        config.permissions.decision_timeout_secs = 7;
        config.cancellation.poll_interval_ms = 0;
        config.cancellation.stop_wait_timeout_secs = 3;
        config.callbacks.include_original_prompt = true;

        let orchestrator = OrchestratorConfig::from(&config);
        assert_eq!(
            orchestrator.permissions.decision_timeout,
            Duration::from_secs(7)
        );
        assert_eq!(orchestrator.poll_interval, Duration::from_millis(1));
        assert_eq!(orchestrator.stop_wait_timeout, Duration::from_secs(3));
        assert!(orchestrator.callbacks.include_original_prompt);
    }

    #[test]
    fn stop_result_constructors() {
        assert!(StopResult::stopped().success);
        let failed = StopResult::failed("nothing running");
        assert!(!failed.success);
        assert_eq!(failed.reason.as_deref(), Some("nothing running"));
    }
}

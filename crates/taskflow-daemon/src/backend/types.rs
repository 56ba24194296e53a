//! Agent backend contract.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;

use crate::permission::PermissionDecision;
use crate::storage::MessageRole;

/// Where and for whom an invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub session_id: String,
    pub task_id: String,
    pub working_directory: Option<PathBuf>,
}

impl InvocationContext {
    pub fn new(session_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            task_id: task_id.into(),
            working_directory: None,
        }
    }
}

/// One discrete execution event produced by a backend.
///
/// Serialized as one NDJSON line per event, tagged by `type`. Unrecognised
/// types decode as [`BackendEvent::Unknown`] and are skipped by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    /// A conversation message to persist.
    Message {
        role: MessageRole,
        content: serde_json::Value,
    },
    /// The backend wants to run a tool that needs approval.
    PermissionRequest {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: serde_json::Value,
    },
    /// Final outcome of the invocation.
    Result {
        #[serde(default)]
        report: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        error: Option<String>,
    },
    /// End of the event stream.
    End,
    #[serde(other)]
    Unknown,
}

/// Event stream of a single invocation.
pub type BackendEventStream =
    Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send + 'static>>;

/// Control surface of a running invocation.
///
/// Both methods may be called concurrently with event consumption.
#[async_trait]
pub trait InvocationHandle: Send + Sync {
    /// Abort the invocation.
    async fn cancel(&self) -> Result<(), BackendError>;

    /// Relay a permission answer for `tool_call_id` back to the backend.
    async fn respond_permission(
        &self,
        tool_call_id: &str,
        decision: &PermissionDecision,
    ) -> Result<(), BackendError>;
}

/// A started invocation: its events plus the handle to steer it.
pub struct Invocation {
    pub events: BackendEventStream,
    pub handle: Arc<dyn InvocationHandle>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation").finish_non_exhaustive()
    }
}

/// Something that can run a prompt as an agent.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        prompt: &str,
    ) -> Result<Invocation, BackendError>;
}

/// Errors from agent backends.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Agent I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent exited with status {code:?}")]
    Exited { code: Option<i32> },

    #[error("Agent input channel closed")]
    Closed,

    #[error("Cancel failed: {0}")]
    Cancel(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_tagged_events() {
        let event: BackendEvent = serde_json::from_str(
            r#"{"type":"permission_request","tool_call_id":"c1","tool_name":"Bash"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            BackendEvent::PermissionRequest {
                tool_call_id: "c1".to_string(),
                tool_name: "Bash".to_string(),
                tool_input: serde_json::Value::Null,
            }
        );

        let event: BackendEvent = serde_json::from_str(
            r#"{"type":"message","role":"assistant","content":[{"type":"text","text":"hi"}]}"#,
        )
        .unwrap();
        match event {
            BackendEvent::Message { role, content } => {
                assert_eq!(role, MessageRole::Assistant);
                assert_eq!(content, json!([{"type": "text", "text": "hi"}]));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn result_fields_default() {
        let event: BackendEvent = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert_eq!(
            event,
            BackendEvent::Result {
                report: None,
                is_error: false,
                error: None,
            }
        );
    }

    #[test]
    fn unknown_types_are_tolerated() {
        let event: BackendEvent =
            serde_json::from_str(r#"{"type":"stream_event","delta":"x"}"#).unwrap();
        assert_eq!(event, BackendEvent::Unknown);
    }
}

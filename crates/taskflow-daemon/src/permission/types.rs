//! Permission coordinator types.

use serde::{Deserialize, Serialize};

/// Who produced a decision when the system resolves a request itself.
pub const DECIDED_BY_SYSTEM: &str = "system";
/// Who produced a decision answered from a remembered grant.
pub const DECIDED_BY_GRANT: &str = "grant";

/// Reason attached to requests resolved by cancellation.
pub const REASON_CANCELLED: &str = "Cancelled";
/// Reason attached to requests that saw no decision in time.
pub const REASON_TIMEOUT: &str = "Timeout";

/// A tool invocation waiting for an allow/deny decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    /// Correlation key for the decision.
    pub request_id: String,
    pub task_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_input: serde_json::Value,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// How long a decision applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    /// Only the request it answers.
    #[default]
    Once,
    /// Every later request for the same tool in the same session.
    Session,
}

/// Answer to a [`PermissionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub request_id: String,
    pub allow: bool,
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub scope: PermissionScope,
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionDecision {
    /// A one-off decision from a user or client.
    pub fn once(request_id: impl Into<String>, allow: bool, decided_by: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            allow,
            remember: false,
            scope: PermissionScope::Once,
            decided_by: decided_by.into(),
            reason: None,
        }
    }

    /// A denial produced by the coordinator itself.
    pub fn system_denial(request_id: impl Into<String>, reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::once(request_id, false, DECIDED_BY_SYSTEM)
        }
    }

    /// Whether this decision should be cached for the session.
    pub const fn is_session_grant(&self) -> bool {
        self.remember && matches!(self.scope, PermissionScope::Session)
    }
}

/// How a pending request was resolved. Exactly one path wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// An external decision (or a remembered grant) arrived.
    Decided(PermissionDecision),
    /// The caller's cancel signal fired or the session's requests were
    /// bulk-cancelled.
    Cancelled { request_id: String },
    /// No decision arrived within the timeout window.
    TimedOut { request_id: String },
}

impl PermissionOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            Self::Decided(d) => &d.request_id,
            Self::Cancelled { request_id } | Self::TimedOut { request_id } => request_id,
        }
    }

    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Decided(d) if d.allow)
    }

    /// Human-readable reason for a denial, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Decided(d) => d.reason.as_deref(),
            Self::Cancelled { .. } => Some(REASON_CANCELLED),
            Self::TimedOut { .. } => Some(REASON_TIMEOUT),
        }
    }

    /// Collapse into the decision that is handed back to the backend.
    pub fn into_decision(self) -> PermissionDecision {
        match self {
            Self::Decided(d) => d,
            Self::Cancelled { request_id } => {
                PermissionDecision::system_denial(request_id, REASON_CANCELLED)
            }
            Self::TimedOut { request_id } => {
                PermissionDecision::system_denial(request_id, REASON_TIMEOUT)
            }
        }
    }
}

/// Notifications broadcast to observers (UIs, transports).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionEvent {
    /// A request now holds its session's slot and awaits a decision.
    Requested(PermissionRequest),
    /// A request was resolved by any path.
    Resolved {
        request_id: String,
        session_id: String,
        allow: bool,
        reason: Option<String>,
    },
}

/// Permission coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum PermissionError {
    #[error("Permission request not found: {request_id}")]
    RequestNotFound { request_id: String },

    #[error("Permission request {request_id} is not awaiting a decision yet")]
    NotAwaitingDecision { request_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_collapses_to_system_denial() {
        let decision = PermissionOutcome::Cancelled {
            request_id: "req-1".to_string(),
        }
        .into_decision();

        assert!(!decision.allow);
        assert_eq!(decision.reason.as_deref(), Some("Cancelled"));
        assert_eq!(decision.scope, PermissionScope::Once);
        assert_eq!(decision.decided_by, "system");
    }

    #[test]
    fn timed_out_collapses_to_system_denial() {
        let outcome = PermissionOutcome::TimedOut {
            request_id: "req-1".to_string(),
        };
        assert!(!outcome.is_allowed());
        assert_eq!(outcome.reason(), Some("Timeout"));

        let decision = outcome.into_decision();
        assert_eq!(decision.reason.as_deref(), Some("Timeout"));
        assert_eq!(decision.decided_by, "system");
    }

    #[test]
    fn only_remembered_session_scope_is_a_grant() {
        let mut decision = PermissionDecision::once("req-1", true, "user-1");
        assert!(!decision.is_session_grant());
        decision.remember = true;
        assert!(!decision.is_session_grant());
        decision.scope = PermissionScope::Session;
        assert!(decision.is_session_grant());
    }

    #[test]
    fn decision_deserializes_with_defaults() {
        let decision: PermissionDecision =
            serde_json::from_str(r#"{"request_id":"r","allow":true,"decided_by":"u"}"#)
                .unwrap_or_else(|e| panic!("{e}"));
        assert!(!decision.remember);
        assert_eq!(decision.scope, PermissionScope::Once);
    }
}

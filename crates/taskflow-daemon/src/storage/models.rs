//! Domain models and their database row representations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::db::DatabaseError;

// =========================================================================
// Statuses
// =========================================================================

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingPermission,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingPermission => "awaiting_permission",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the status is final (`completed`, `failed` or `stopped`).
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Whether a task in this status needs a live invocation behind it.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::AwaitingPermission)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_permission" => Ok(Self::AwaitingPermission),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(DatabaseError::Corrupt(format!("unknown task status {other}"))),
        }
    }
}

/// Session status, mirroring the latest task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    AwaitingPermission,
}

impl SessionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingPermission => "awaiting_permission",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "awaiting_permission" => Ok(Self::AwaitingPermission),
            other => Err(DatabaseError::Corrupt(format!(
                "unknown session status {other}"
            ))),
        }
    }
}

// =========================================================================
// Tasks
// =========================================================================

/// Span of session messages produced by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRange {
    pub start_index: Option<i64>,
    pub end_index: Option<i64>,
    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,
}

impl MessageRange {
    /// Number of messages covered, 0 when either bound is unknown.
    pub fn message_count(&self) -> i64 {
        match (self.start_index, self.end_index) {
            (Some(start), Some(end)) => end - start + 1,
            _ => 0,
        }
    }
}

/// One prompt-to-completion unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub session_id: String,
    pub status: TaskStatus,
    /// Prompt that spawned the task.
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub message_range: MessageRange,
    pub tool_use_count: i64,
    pub report: Option<String>,
    pub error: Option<String>,
}

/// Parameters for inserting a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub session_id: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: i64,
}

/// Partial task update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub message_range: MessageRange,
    pub tool_use_count: Option<i64>,
    pub report: Option<String>,
    pub error: Option<String>,
}

/// Task record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub session_id: String,
    pub status: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub msg_start_index: Option<i64>,
    pub msg_end_index: Option<i64>,
    pub msg_start_timestamp: Option<i64>,
    pub msg_end_timestamp: Option<i64>,
    pub tool_use_count: i64,
    pub report: Option<String>,
    pub error: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DatabaseError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: row.status.parse()?,
            id: row.id,
            session_id: row.session_id,
            description: row.description,
            created_by: row.created_by,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            message_range: MessageRange {
                start_index: row.msg_start_index,
                end_index: row.msg_end_index,
                start_timestamp: row.msg_start_timestamp,
                end_timestamp: row.msg_end_timestamp,
            },
            tool_use_count: row.tool_use_count,
            report: row.report,
            error: row.error,
        })
    }
}

// =========================================================================
// Sessions
// =========================================================================

/// Per-session callback preferences; unset keys fall through to the parent
/// and then to the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_original_prompt: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_last_message: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Parent/child linkage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genealogy {
    pub parent_session_id: Option<String>,
}

/// A persistent conversation/work context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub ready_for_prompt: bool,
    pub genealogy: Genealogy,
    pub callback_config: Option<CallbackConfig>,
    /// User that created the session; callbacks into it run as this user.
    pub created_by: Option<String>,
    /// Task ids in insertion order.
    pub tasks: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    /// The most recently issued task.
    pub fn latest_task_id(&self) -> Option<&str> {
        self.tasks.last().map(String::as_str)
    }

    /// Whether `task_id` is the most recently issued task.
    pub fn is_latest_task(&self, task_id: &str) -> bool {
        self.latest_task_id() == Some(task_id)
    }
}

/// Parameters for inserting a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub id: String,
    pub parent_session_id: Option<String>,
    pub callback_config: Option<CallbackConfig>,
    pub created_by: Option<String>,
}

/// Partial session update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub ready_for_prompt: Option<bool>,
    pub callback_config: Option<CallbackConfig>,
}

/// Session record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub id: String,
    pub status: String,
    pub ready_for_prompt: i64,
    pub parent_session_id: Option<String>,
    pub callback_config: Option<String>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRow {
    pub fn into_session(self, tasks: Vec<String>) -> Result<Session, DatabaseError> {
        let callback_config = self
            .callback_config
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Session {
            status: self.status.parse()?,
            ready_for_prompt: self.ready_for_prompt != 0,
            genealogy: Genealogy {
                parent_session_id: self.parent_session_id,
            },
            callback_config,
            created_by: self.created_by,
            tasks,
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// =========================================================================
// Messages
// =========================================================================

/// Author of a session message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl FromStr for MessageRole {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(DatabaseError::Corrupt(format!("unknown message role {other}"))),
        }
    }
}

/// A stored session message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub task_id: Option<String>,
    /// Position within the session, assigned by the store.
    pub index: i64,
    pub role: MessageRole,
    /// Either a plain string or a list of typed content segments.
    pub content: serde_json::Value,
    pub created_at: i64,
}

impl Message {
    /// Number of `tool_use` segments in the content.
    pub fn tool_use_count(&self) -> i64 {
        self.content.as_array().map_or(0, |segments| {
            let count = segments
                .iter()
                .filter(|s| s.get("type").and_then(serde_json::Value::as_str) == Some("tool_use"))
                .count();
            i64::try_from(count).unwrap_or(i64::MAX)
        })
    }

    /// Plain text of the message: the string itself, or every `text`
    /// segment concatenated when the content is structured.
    pub fn text(&self) -> Option<String> {
        match &self.content {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Array(segments) => Some(
                segments
                    .iter()
                    .filter(|s| s.get("type").and_then(serde_json::Value::as_str) == Some("text"))
                    .filter_map(|s| s.get("text").and_then(serde_json::Value::as_str))
                    .collect::<String>(),
            ),
            _ => None,
        }
    }
}

/// Parameters for appending a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub task_id: Option<String>,
    pub role: MessageRole,
    pub content: serde_json::Value,
}

/// Message record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub session_id: String,
    pub task_id: Option<String>,
    pub idx: i64,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = DatabaseError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            role: row.role.parse()?,
            content: serde_json::from_str(&row.content)?,
            id: row.id,
            session_id: row.session_id,
            task_id: row.task_id,
            index: row.idx,
            created_at: row.created_at,
        })
    }
}

// =========================================================================
// Queue
// =========================================================================

/// Metadata attached to a queued message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(default)]
    pub is_callback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_task_id: Option<String>,
    /// Identity the queued prompt is processed under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_by_user_id: Option<String>,
}

/// A prompt waiting in a session's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub metadata: QueueMetadata,
    pub created_at: i64,
}

/// Queued message record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct QueuedMessageRow {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub metadata: String,
    pub created_at: i64,
}

impl TryFrom<QueuedMessageRow> for QueuedMessage {
    type Error = DatabaseError;

    fn try_from(row: QueuedMessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            metadata: serde_json::from_str(&row.metadata)?,
            id: row.id,
            session_id: row.session_id,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(content: serde_json::Value) -> Message {
        Message {
            id: 1,
            session_id: "s1".to_string(),
            task_id: Some("t1".to_string()),
            index: 0,
            role: MessageRole::Assistant,
            content,
            created_at: 0,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Stopped.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::AwaitingPermission.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn status_parse_matches_as_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::AwaitingPermission,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().ok(), Some(status));
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn message_count_needs_both_bounds() {
        let mut range = MessageRange::default();
        assert_eq!(range.message_count(), 0);
        range.start_index = Some(3);
        assert_eq!(range.message_count(), 0);
        range.end_index = Some(7);
        assert_eq!(range.message_count(), 5);
    }

    #[test]
    fn text_concatenates_text_segments_only() {
        let msg = message(json!([
            {"type": "text", "text": "Hello, "},
            {"type": "tool_use", "id": "tu1", "name": "Bash", "input": {}},
            {"type": "text", "text": "world"}
        ]));
        assert_eq!(msg.text().as_deref(), Some("Hello, world"));
        assert_eq!(msg.tool_use_count(), 1);
    }

    #[test]
    fn text_of_plain_string() {
        let msg = message(json!("done"));
        assert_eq!(msg.text().as_deref(), Some("done"));
        assert_eq!(msg.tool_use_count(), 0);
    }

    #[test]
    fn queue_metadata_skips_absent_fields() {
        let meta = QueueMetadata {
            is_callback: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap_or_default();
        assert_eq!(json, json!({"is_callback": true}));
    }
}

//! Parent callback router.
//!
//! When a child session's task finishes, a summary is queued into the
//! parent session and the parent's queue is kicked.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use taskflow_core::config::CallbackDefaults;

use super::config::resolve;
use super::template::{DEFAULT_TEMPLATE, render};
use super::trigger::{QueueTrigger, TriggerOptions};
use crate::storage::{
    DatabaseError, MessageRole, QueueMetadata, Session, Store, Task, TaskStatus,
};

/// `source` recorded on queued callback messages.
pub const CALLBACK_SOURCE: &str = "child_task_callback";

const SHORT_ID_LEN: usize = 8;

fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// Values available to callback templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    pub child_session_id: String,
    pub child_task_id: String,
    pub parent_session_id: String,
    pub status: TaskStatus,
    pub completed_at: Option<i64>,
    pub message_count: i64,
    pub tool_use_count: i64,
    pub original_prompt: Option<String>,
    pub last_message: Option<String>,
}

impl CallbackContext {
    pub fn vars(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::from([
            ("child_session_id", self.child_session_id.clone()),
            (
                "child_session_id_short",
                short_id(&self.child_session_id).to_string(),
            ),
            ("child_task_id", self.child_task_id.clone()),
            (
                "child_task_id_short",
                short_id(&self.child_task_id).to_string(),
            ),
            ("parent_session_id", self.parent_session_id.clone()),
            (
                "parent_session_id_short",
                short_id(&self.parent_session_id).to_string(),
            ),
            ("status", self.status.to_string()),
            ("message_count", self.message_count.to_string()),
            ("tool_use_count", self.tool_use_count.to_string()),
        ]);
        if let Some(completed_at) = self.completed_at {
            vars.insert("completed_at", completed_at.to_string());
        }
        if let Some(prompt) = &self.original_prompt {
            vars.insert("original_prompt", prompt.clone());
        }
        if let Some(message) = &self.last_message {
            vars.insert("last_message", message.clone());
        }
        vars
    }
}

/// Routes finished child tasks back to their parent session.
pub struct CallbackRouter {
    store: Arc<dyn Store>,
    trigger: Arc<dyn QueueTrigger>,
    defaults: CallbackDefaults,
}

impl CallbackRouter {
    pub fn new(
        store: Arc<dyn Store>,
        trigger: Arc<dyn QueueTrigger>,
        defaults: CallbackDefaults,
    ) -> Self {
        Self {
            store,
            trigger,
            defaults,
        }
    }

    /// Queue a callback for `task` into `child`'s parent, if any.
    ///
    /// Never fails: every error is logged.
    pub async fn route(&self, task: &Task, child: &Session) {
        if let Err(e) = self.try_route(task, child).await {
            warn!(
                session_id = %child.id,
                task_id = %task.id,
                parent_session_id = ?child.genealogy.parent_session_id,
                error = %e,
                "Failed to route child task callback"
            );
        }
    }

    async fn try_route(&self, task: &Task, child: &Session) -> Result<(), DatabaseError> {
        let Some(parent_id) = child.genealogy.parent_session_id.as_deref() else {
            return Ok(());
        };

        let parent = self.store.get_session(parent_id).await?;
        let config = resolve(
            child.callback_config.as_ref(),
            parent.callback_config.as_ref(),
            &self.defaults,
        );
        if !config.enabled {
            debug!(session_id = %child.id, parent_session_id = parent_id, "Callbacks disabled");
            return Ok(());
        }

        let Some(queued_by) = parent.created_by.clone() else {
            warn!(
                session_id = %child.id,
                parent_session_id = parent_id,
                "Parent session has no creator, callback dropped"
            );
            return Ok(());
        };

        let last_message = if config.include_last_message {
            self.last_assistant_message(task).await?
        } else {
            None
        };

        let context = CallbackContext {
            child_session_id: child.id.clone(),
            child_task_id: task.id.clone(),
            parent_session_id: parent_id.to_string(),
            status: task.status,
            completed_at: task.completed_at,
            message_count: task.message_range.message_count(),
            tool_use_count: task.tool_use_count,
            original_prompt: config
                .include_original_prompt
                .then(|| task.description.clone()),
            last_message,
        };
        let template = config.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        let content = render(template, &context.vars());

        let metadata = QueueMetadata {
            is_callback: true,
            source: Some(CALLBACK_SOURCE.to_string()),
            child_session_id: Some(child.id.clone()),
            child_task_id: Some(task.id.clone()),
            queued_by_user_id: Some(queued_by),
        };
        let queue_id = self
            .store
            .enqueue_message(parent_id, &content, &metadata)
            .await?;
        info!(
            session_id = %child.id,
            task_id = %task.id,
            parent_session_id = parent_id,
            queue_id,
            "Queued callback for parent session"
        );

        let trigger = Arc::clone(&self.trigger);
        let parent_id = parent_id.to_string();
        tokio::spawn(async move {
            trigger
                .trigger(&parent_id, TriggerOptions::from_source(CALLBACK_SOURCE))
                .await;
        });

        Ok(())
    }

    /// Text of the task's highest-index assistant message.
    async fn last_assistant_message(&self, task: &Task) -> Result<Option<String>, DatabaseError> {
        let messages = self
            .store
            .list_task_messages(&task.session_id, &task.id)
            .await?;
        Ok(messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .max_by_key(|m| m.index)
            .and_then(crate::storage::Message::text))
    }
}

//! Per-session "stop requested" flags.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

/// Shared registry of sessions whose active invocation should stop.
#[derive(Debug, Clone, Default)]
pub struct StopFlags {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl StopFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the active invocation of `session_id` to stop.
    pub async fn request_stop(&self, session_id: &str) {
        self.inner.write().await.insert(session_id.to_string());
        debug!(session_id, "Stop requested");
    }

    pub async fn is_stop_requested(&self, session_id: &str) -> bool {
        self.inner.read().await.contains(session_id)
    }

    /// Clear the flag. Returns whether it was set.
    pub async fn clear(&self, session_id: &str) -> bool {
        self.inner.write().await.remove(session_id)
    }
}

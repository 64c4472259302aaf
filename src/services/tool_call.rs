use chrono::{DateTime, Utc};
use moka::sync::Cache;
use tracing::{debug, info};

use crate::config::CLOVER_CONFIG;

/// A tool-use id parked with its session until the client turns in the
/// matching tool result
#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub tool_use_id: String,
    pub session_id: String,
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry of outstanding tool calls, TTL-evicted.
#[derive(Clone)]
pub struct ToolCallRegistry {
    calls: Cache<String, ToolCallState>,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        let ttl = CLOVER_CONFIG.load().tool_call_timeout.max(1);
        Self::with_ttl(std::time::Duration::from_secs(ttl))
    }

    pub fn with_ttl(ttl: std::time::Duration) -> Self {
        Self {
            calls: Cache::builder().max_capacity(10_000).time_to_live(ttl).build(),
        }
    }

    pub fn register(&self, tool_use_id: String, session_id: String, message_id: Option<String>) {
        info!("Registered tool call {tool_use_id} for session {session_id}");
        self.calls.insert(
            tool_use_id.to_owned(),
            ToolCallState {
                tool_use_id,
                session_id,
                message_id,
                created_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, tool_use_id: &str) -> Option<ToolCallState> {
        self.calls.get(tool_use_id)
    }

    /// Remove a completed call, returning its state
    pub fn complete(&self, tool_use_id: &str) -> Option<ToolCallState> {
        let state = self.calls.remove(tool_use_id);
        if state.is_some() {
            debug!("Completed tool call {tool_use_id}");
        }
        state
    }

    pub fn spawn_sweeper(&self) {
        let registry = self.to_owned();
        tokio::spawn(async move {
            let period = CLOVER_CONFIG.load().tool_call_cleanup_interval.max(1);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.calls.run_pending_tasks();
            }
        });
    }

    pub fn len(&self) -> usize {
        self.calls.run_pending_tasks();
        self.calls.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

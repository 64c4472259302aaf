use tracing::info;

use crate::{
    account::AccountPoolHandle,
    claude_web::SessionManager,
    config::CLOVER_CONFIG,
    error::CloverError,
    services::{PromptCacheRegistry, ToolCallRegistry},
};

/// Process-wide singletons, constructed once at boot and injected
/// through the router.
#[derive(Clone)]
pub struct AppState {
    pub pool: AccountPoolHandle,
    pub sessions: SessionManager,
    pub tool_calls: ToolCallRegistry,
    pub prompt_cache: PromptCacheRegistry,
}

impl AppState {
    /// Build the state, seed cookie accounts and start background loops
    pub async fn new() -> Result<Self, CloverError> {
        let pool = AccountPoolHandle::start().await?;
        let sessions = SessionManager::new(pool.to_owned());
        let tool_calls = ToolCallRegistry::new();
        let prompt_cache = PromptCacheRegistry::new();

        for cookie in CLOVER_CONFIG.load().cookies.to_owned() {
            if let Err(e) = pool.add(Some(cookie), None, None, None).await {
                tracing::warn!("Failed to seed cookie account: {e}");
            }
        }

        sessions.spawn_sweeper();
        tool_calls.spawn_sweeper();
        prompt_cache.spawn_sweeper();
        Ok(Self {
            pool,
            sessions,
            tool_calls,
            prompt_cache,
        })
    }

    /// Bare state over an in-memory pool, for tests
    pub async fn new_in_memory() -> Result<Self, CloverError> {
        let pool = AccountPoolHandle::start_in_memory().await?;
        Ok(Self {
            sessions: SessionManager::new(pool.to_owned()),
            pool,
            tool_calls: ToolCallRegistry::with_ttl(std::time::Duration::from_secs(300)),
            prompt_cache: PromptCacheRegistry::with_ttl(std::time::Duration::from_secs(300)),
        })
    }

    /// Graceful shutdown: evict all sessions, stop the pool actor
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.sessions.cleanup_all().await;
        self.pool.stop().await;
    }
}

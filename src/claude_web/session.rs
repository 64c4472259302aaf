use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use async_stream::try_stream;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    account::{Account, AccountFilter, AccountPoolHandle},
    claude_web::client::WebClient,
    config::CLOVER_CONFIG,
    error::{CloverError, WreqSnafu},
    stream::LineStream,
    types::web::WebRequestBody,
};

#[derive(Default)]
struct ConversationState {
    conv_uuid: Option<String>,
    paprika_mode: Option<String>,
}

struct SessionInner {
    session_id: String,
    account: Account,
    client: WebClient,
    pool: AccountPoolHandle,
    last_activity: AtomicI64,
    conversation: Mutex<ConversationState>,
    /// At most one inflight upstream stream; an early consumer break
    /// leaves it parked here for resumption
    stream_slot: Mutex<Option<LineStream>>,
    cleaned: AtomicBool,
}

/// Per-client handle to a live Claude.ai conversation, bound to one
/// pool account for its lifetime.
#[derive(Clone)]
pub struct WebSession {
    inner: Arc<SessionInner>,
}

impl WebSession {
    async fn initialize(
        session_id: String,
        pool: AccountPoolHandle,
    ) -> Result<Self, CloverError> {
        let account = pool
            .acquire_session(session_id.to_owned(), AccountFilter::default())
            .await?;
        let client = WebClient::new(&account, pool.to_owned())?;
        Ok(Self {
            inner: Arc::new(SessionInner {
                session_id,
                account,
                client,
                pool,
                last_activity: AtomicI64::new(Utc::now().timestamp_millis()),
                conversation: Mutex::new(ConversationState::default()),
                stream_slot: Mutex::new(None),
                cleaned: AtomicBool::new(false),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    pub fn touch(&self) {
        self.inner
            .last_activity
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.inner.last_activity.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self) -> bool {
        let timeout_millis = CLOVER_CONFIG.load().session_timeout as i64 * 1000;
        self.idle_millis() > timeout_millis
    }

    /// Lazily create the conversation; caches the server's paprika mode
    async fn ensure_conversation(&self) -> Result<String, CloverError> {
        let mut conversation = self.inner.conversation.lock().await;
        if let Some(ref uuid) = conversation.conv_uuid {
            return Ok(uuid.to_owned());
        }
        let (uuid, paprika_mode) = self.inner.client.create_conversation().await?;
        conversation.conv_uuid = Some(uuid.to_owned());
        conversation.paprika_mode = paprika_mode;
        Ok(uuid)
    }

    /// PUT the conversation mode only when the cached one differs
    pub async fn set_paprika_mode(&self, mode: Option<&str>) -> Result<(), CloverError> {
        let conv_uuid = self.ensure_conversation().await?;
        let mut conversation = self.inner.conversation.lock().await;
        if conversation.paprika_mode.as_deref() == mode {
            return Ok(());
        }
        self.inner.client.set_paprika_mode(&conv_uuid, mode).await?;
        conversation.paprika_mode = mode.map(str::to_string);
        Ok(())
    }

    pub async fn upload_file(
        &self,
        bytes: Vec<u8>,
        file_name: String,
        content_type: &str,
    ) -> Result<String, CloverError> {
        self.touch();
        self.inner
            .client
            .upload_file(bytes, file_name, content_type)
            .await
    }

    /// Send a completion request and park its line stream in the slot
    pub async fn send_message(&self, body: &WebRequestBody) -> Result<(), CloverError> {
        self.touch();
        let conv_uuid = self.ensure_conversation().await?;
        let response = self.inner.client.send_message(&conv_uuid, body).await?;
        let lines = Self::lines_of(response, self.inner.clone());
        *self.inner.stream_slot.lock().await = Some(lines);
        debug!("Message sent for session {}", self.inner.session_id);
        Ok(())
    }

    pub async fn send_tool_result(&self, payload: &Value) -> Result<(), CloverError> {
        self.touch();
        let conversation = self.inner.conversation.lock().await;
        let conv_uuid =
            conversation
                .conv_uuid
                .as_deref()
                .ok_or(CloverError::UnexpectedNone {
                    msg: "tool result requires an active conversation",
                })?;
        self.inner.client.send_tool_result(conv_uuid, payload).await
    }

    pub async fn has_stream(&self) -> bool {
        self.inner.stream_slot.lock().await.is_some()
    }

    /// Split the upstream body into newline-terminated lines, touching
    /// last_activity per chunk
    fn lines_of(response: wreq::Response, inner: Arc<SessionInner>) -> LineStream {
        Box::pin(try_stream! {
            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.context(WreqSnafu {
                    msg: "Upstream stream read failed",
                })?;
                inner
                    .last_activity
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    yield String::from_utf8_lossy(&line).into_owned();
                }
            }
            if !buffer.is_empty() {
                yield String::from_utf8_lossy(&buffer).into_owned();
            }
        })
    }

    /// Reader over the parked stream.
    ///
    /// Pulls lines from the slot without taking ownership, so a consumer
    /// that stops early (tool-use pause, stop sequence) leaves the
    /// upstream stream in place. Natural exhaustion evicts the session.
    pub fn read_lines(&self, manager: SessionManager) -> LineStream {
        let inner = self.inner.clone();
        Box::pin(try_stream! {
            loop {
                let mut slot = inner.stream_slot.lock().await;
                let Some(stream) = slot.as_mut() else { break };
                match stream.next().await {
                    Some(line) => {
                        drop(slot);
                        yield line?;
                    }
                    None => {
                        *slot = None;
                        drop(slot);
                        debug!("Stream completed for session {}", inner.session_id);
                        manager.remove(&inner.session_id).await;
                        break;
                    }
                }
            }
        })
    }

    /// Delete the conversation upstream (unless preserved) and release
    /// the account binding. Idempotent.
    pub async fn cleanup(&self) {
        if self.inner.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Cleaning up session {}", self.inner.session_id);
        if !CLOVER_CONFIG.load().preserve_chats {
            let conversation = self.inner.conversation.lock().await;
            if let Some(ref conv_uuid) = conversation.conv_uuid {
                let _ = self.inner.client.delete_conversation(conv_uuid).await;
            }
        }
        let _ = self
            .inner
            .pool
            .release_session(self.inner.session_id.to_owned())
            .await;
    }
}

struct ManagerInner {
    sessions: Mutex<HashMap<String, WebSession>>,
    pool: AccountPoolHandle,
}

/// Registry of live web sessions with idle-timeout eviction.
///
/// The mutex guards atomic lookup-or-create; cleanup always runs as a
/// detached task so no caller blocks on upstream deletes.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(pool: AccountPoolHandle) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                sessions: Mutex::new(HashMap::new()),
                pool,
            }),
        }
    }

    pub async fn get_or_create(&self, session_id: &str) -> Result<WebSession, CloverError> {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.get(session_id) {
            return Ok(session.to_owned());
        }
        let session =
            WebSession::initialize(session_id.to_string(), self.inner.pool.to_owned()).await?;
        sessions.insert(session_id.to_string(), session.to_owned());
        debug!("Created session {session_id}");
        Ok(session)
    }

    /// Lookup that treats an expired session as a miss and evicts it
    pub async fn get(&self, session_id: &str) -> Option<WebSession> {
        let mut sessions = self.inner.sessions.lock().await;
        let session = sessions.get(session_id)?.to_owned();
        if session.is_expired() {
            debug!("Session {session_id} expired");
            sessions.remove(session_id);
            tokio::spawn(async move { session.cleanup().await });
            return None;
        }
        Some(session)
    }

    pub async fn remove(&self, session_id: &str) {
        let mut sessions = self.inner.sessions.lock().await;
        if let Some(session) = sessions.remove(session_id) {
            tokio::spawn(async move { session.cleanup().await });
            debug!("Removed session {session_id}");
        }
    }

    async fn sweep(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        let expired = sessions
            .iter()
            .filter(|(_, s)| s.is_expired())
            .map(|(id, _)| id.to_owned())
            .collect::<Vec<_>>();
        if expired.is_empty() {
            return;
        }
        info!("Evicting {} expired sessions", expired.len());
        for session_id in expired {
            if let Some(session) = sessions.remove(&session_id) {
                tokio::spawn(async move { session.cleanup().await });
            }
        }
    }

    /// Interval sweeper for idle sessions
    pub fn spawn_sweeper(&self) {
        let manager = self.to_owned();
        tokio::spawn(async move {
            let period = CLOVER_CONFIG.load().session_cleanup_interval.max(1);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.sweep().await;
            }
        });
    }

    /// Evict everything; used on shutdown
    pub async fn cleanup_all(&self) {
        let sessions = {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.drain().collect::<Vec<_>>()
        };
        for (_, session) in sessions {
            session.cleanup().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.lock().await.is_empty()
    }

    pub fn pool(&self) -> &AccountPoolHandle {
        &self.inner.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager_with_cookie_account() -> SessionManager {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        pool.add(
            Some("cookie-test".to_string()),
            None,
            Some("org-test".to_string()),
            None,
        )
        .await
        .unwrap();
        SessionManager::new(pool)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let manager = manager_with_cookie_account().await;
        let a = manager.get_or_create("s1").await.unwrap();
        let b = manager.get_or_create("s1").await.unwrap();
        assert_eq!(a.session_id(), b.session_id());
        assert_eq!(manager.len().await, 1);
        assert_eq!(a.account().organization_uuid, "org-test");
    }

    #[tokio::test]
    async fn get_misses_unknown_sessions() {
        let manager = manager_with_cookie_account().await;
        assert!(manager.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn remove_releases_the_binding() {
        let manager = manager_with_cookie_account().await;
        manager.get_or_create("s1").await.unwrap();
        let pool = manager.pool().to_owned();
        assert_eq!(pool.status().await.unwrap().active_sessions, 1);
        manager.remove("s1").await;
        assert!(manager.get("s1").await.is_none());
        // cleanup runs detached; poll for the release
        for _ in 0..50 {
            if pool.status().await.unwrap().active_sessions == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("session binding was not released");
    }

    #[tokio::test]
    async fn session_creation_fails_without_accounts() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        let manager = SessionManager::new(pool);
        assert!(matches!(
            manager.get_or_create("s1").await,
            Err(CloverError::NoAccountsAvailable)
        ));
    }
}

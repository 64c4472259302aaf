use std::collections::{HashMap, HashSet};

use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::Serialize;
use snafu::{GenerateImplicitData, Location};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    account::{Account, AccountStatus, AuthType, OAuthToken, OauthAuthenticator, Verdict},
    config::{CLOVER_CONFIG, TOKEN_REFRESH_WINDOW_SECS},
    error::CloverError,
};

/// Capability filters applied during account selection
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountFilter {
    pub is_pro: Option<bool>,
    pub is_max: Option<bool>,
}

impl AccountFilter {
    pub fn max_only() -> Self {
        Self {
            is_pro: None,
            is_max: Some(true),
        }
    }

    fn matches(&self, account: &Account) -> bool {
        if self.is_pro == Some(true) && !account.is_pro() {
            return false;
        }
        if self.is_max == Some(true) && !account.is_max() {
            return false;
        }
        true
    }
}

/// Credentials offered to the pool by intake paths
#[derive(Debug, Default)]
pub struct AccountSeed {
    pub cookie: Option<String>,
    pub oauth: Option<OAuthToken>,
    pub org_uuid: Option<String>,
    pub capabilities: Option<Vec<String>>,
}

/// Aggregate pool statistics for /health and /statistics
#[derive(Debug, Serialize, Clone)]
pub struct PoolStatus {
    pub total_accounts: usize,
    pub valid_accounts: usize,
    pub rate_limited_accounts: usize,
    pub invalid_accounts: usize,
    pub active_sessions: usize,
}

#[derive(Debug)]
enum PoolMessage {
    /// Add or merge an account
    Insert(AccountSeed, RpcReplyPort<Result<Account, CloverError>>),
    /// Purge an account and its bindings
    Remove(String, RpcReplyPort<Result<(), CloverError>>),
    /// Select and bind an account for a web session
    AcquireSession(String, AccountFilter, RpcReplyPort<Result<Account, CloverError>>),
    /// Select a token-carrying account for an API call
    AcquireOauth(AccountFilter, RpcReplyPort<Result<Account, CloverError>>),
    /// Stickiness lookup from the prompt-cache registry
    AcquireById(String, RpcReplyPort<Option<Account>>),
    /// Break a session binding
    ReleaseSession(String),
    /// Refresh last_used
    Touch(String),
    /// Scoped-borrow exit verdict
    Report(String, Verdict),
    /// Store a fresh token (authentication or refresh)
    SetToken(String, Option<Vec<String>>, OAuthToken),
    /// A spawned refresh attempt failed
    RefreshFailed(String),
    /// Background pass: recovery and token refresh
    Tick,
    List(RpcReplyPort<Vec<Account>>),
    Status(RpcReplyPort<PoolStatus>),
}

struct PoolState {
    accounts: HashMap<String, Account>,
    cookie_index: HashMap<String, String>,
    session_index: HashMap<String, String>,
    account_sessions: HashMap<String, HashSet<String>>,
    refreshing: HashSet<String>,
}

struct AccountActor {
    oauth: OauthAuthenticator,
    persist: bool,
}

impl AccountActor {
    fn save(&self, state: &PoolState) {
        if !self.persist || CLOVER_CONFIG.load().no_filesystem_mode {
            return;
        }
        let snapshot = state.accounts.to_owned();
        tokio::spawn(async move {
            let path = CLOVER_CONFIG.load().accounts_path();
            let write = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let body = serde_json::to_string_pretty(&snapshot)?;
                tokio::fs::write(&path, body).await?;
                Ok::<_, CloverError>(())
            };
            if let Err(e) = write.await {
                error!("Failed to save accounts: {e}");
            }
        });
    }

    fn load(persist: bool) -> HashMap<String, Account> {
        if !persist || CLOVER_CONFIG.load().no_filesystem_mode {
            return HashMap::new();
        }
        let path = CLOVER_CONFIG.load().accounts_path();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            info!("No accounts file at {}", path.display());
            return HashMap::new();
        };
        match serde_json::from_str::<HashMap<String, Account>>(&raw) {
            Ok(accounts) => {
                info!("Loaded {} accounts from {}", accounts.len(), path.display());
                accounts
            }
            Err(e) => {
                error!("Failed to parse accounts file: {e}");
                HashMap::new()
            }
        }
    }

    fn log(state: &PoolState) {
        let valid = state
            .accounts
            .values()
            .filter(|a| a.status == AccountStatus::Valid)
            .count();
        info!(
            "Accounts: {} valid / {} total, {} bound sessions",
            valid,
            state.accounts.len(),
            state.session_index.len()
        );
    }

    fn unbind_session(state: &mut PoolState, session_id: &str) {
        if let Some(org) = state.session_index.remove(session_id)
            && let Some(sessions) = state.account_sessions.get_mut(&org)
        {
            sessions.remove(session_id);
        }
    }

    fn insert(&self, state: &mut PoolState, seed: AccountSeed) -> Result<Account, CloverError> {
        let AccountSeed {
            cookie,
            oauth,
            org_uuid,
            capabilities,
        } = seed;
        if cookie.is_none() && oauth.is_none() {
            return Err(CloverError::UnexpectedNone {
                msg: "account needs a cookie or an oauth token",
            });
        }
        // an already-known cookie resolves to its account
        if let Some(ref cookie) = cookie
            && let Some(org) = state.cookie_index.get(cookie)
        {
            return Ok(state.accounts[org].to_owned());
        }
        let org_uuid = org_uuid.unwrap_or_else(|| {
            let generated = Uuid::new_v4().to_string();
            info!("Generated organization UUID: {generated}");
            generated
        });

        let account = if let Some(existing) = state.accounts.get_mut(&org_uuid) {
            // merge credentials into the existing account
            if let Some(cookie) = cookie {
                if let Some(old) = existing.cookie_value.replace(cookie.to_owned()) {
                    state.cookie_index.remove(&old);
                }
                state.cookie_index.insert(cookie, org_uuid.to_owned());
            }
            if let Some(oauth) = oauth {
                existing.oauth_token = Some(oauth);
            }
            if let Some(capabilities) = capabilities {
                existing.capabilities = capabilities;
            }
            existing.recompute_auth_type();
            existing.to_owned()
        } else {
            let account = Account::new(
                org_uuid.to_owned(),
                capabilities.unwrap_or_default(),
                cookie.to_owned(),
                oauth,
            );
            if let Some(cookie) = cookie {
                state.cookie_index.insert(cookie, org_uuid.to_owned());
            }
            state
                .accounts
                .insert(org_uuid.to_owned(), account.to_owned());
            info!("Added account {}", account.ellipse());
            account
        };
        self.save(state);
        Self::log(state);
        Ok(account)
    }

    fn remove(&self, state: &mut PoolState, org_uuid: &str) -> Result<(), CloverError> {
        let Some(account) = state.accounts.remove(org_uuid) else {
            return Err(CloverError::UnexpectedNone {
                msg: "account not found",
            });
        };
        if let Some(cookie) = account.cookie_value {
            state.cookie_index.remove(&cookie);
        }
        if let Some(sessions) = state.account_sessions.remove(org_uuid) {
            for session_id in sessions {
                state.session_index.remove(&session_id);
            }
        }
        info!("Removed account {org_uuid}");
        self.save(state);
        Self::log(state);
        Ok(())
    }

    fn acquire_session(
        &self,
        state: &mut PoolState,
        session_id: String,
        filter: AccountFilter,
    ) -> Result<Account, CloverError> {
        // sticky binding, as long as the account is still valid
        if let Some(org) = state.session_index.get(&session_id).cloned() {
            match state.accounts.get_mut(&org) {
                Some(account) if account.status == AccountStatus::Valid => {
                    account.last_used = Utc::now();
                    return Ok(account.to_owned());
                }
                _ => Self::unbind_session(state, &session_id),
            }
        }
        let max_sessions = CLOVER_CONFIG.load().max_sessions_per_cookie;
        let best = state
            .accounts
            .values()
            .filter(|a| a.status == AccountStatus::Valid)
            .filter(|a| a.has_cookie())
            .filter(|a| matches!(a.auth_type, AuthType::CookieOnly | AuthType::Both))
            .filter(|a| filter.matches(a))
            .map(|a| {
                let count = state
                    .account_sessions
                    .get(&a.organization_uuid)
                    .map(|s| s.len())
                    .unwrap_or_default();
                (count, a.last_used, a.organization_uuid.to_owned())
            })
            .filter(|(count, ..)| *count < max_sessions)
            .min_by_key(|(count, last_used, _)| (*count, *last_used));
        let Some((_, _, org)) = best else {
            return Err(CloverError::NoAccountsAvailable);
        };
        state
            .session_index
            .insert(session_id.to_owned(), org.to_owned());
        state
            .account_sessions
            .entry(org.to_owned())
            .or_default()
            .insert(session_id);
        let account = state
            .accounts
            .get_mut(&org)
            .expect("selected account exists");
        account.last_used = Utc::now();
        let account = account.to_owned();
        self.save(state);
        Ok(account)
    }

    fn acquire_oauth(
        &self,
        state: &mut PoolState,
        filter: AccountFilter,
    ) -> Result<Account, CloverError> {
        let best = state
            .accounts
            .values()
            .filter(|a| a.status == AccountStatus::Valid)
            .filter(|a| a.has_oauth())
            .filter(|a| matches!(a.auth_type, AuthType::OauthOnly | AuthType::Both))
            .filter(|a| filter.matches(a))
            .min_by_key(|a| a.last_used)
            .map(|a| a.organization_uuid.to_owned());
        let Some(org) = best else {
            return Err(CloverError::NoAccountsAvailable);
        };
        let account = state
            .accounts
            .get_mut(&org)
            .expect("selected account exists");
        account.last_used = Utc::now();
        let account = account.to_owned();
        self.save(state);
        Ok(account)
    }

    fn acquire_by_id(&self, state: &mut PoolState, org_uuid: &str) -> Option<Account> {
        let account = state.accounts.get_mut(org_uuid)?;
        if account.status != AccountStatus::Valid || !account.has_oauth() {
            return None;
        }
        account.last_used = Utc::now();
        let account = account.to_owned();
        self.save(state);
        Some(account)
    }

    fn report(&self, state: &mut PoolState, org_uuid: &str, verdict: Verdict) {
        let Some(account) = state.accounts.get_mut(org_uuid) else {
            return;
        };
        match verdict {
            Verdict::RateLimited(resets_at) => {
                warn!(
                    "Account {} rate limited until {}",
                    account.ellipse(),
                    resets_at
                );
                account.rate_limit(resets_at);
            }
            Verdict::Disabled => {
                warn!("Account {} organization disabled", account.ellipse());
                account.status = AccountStatus::Invalid;
                account.resets_at = None;
            }
        }
        self.save(state);
        Self::log(state);
    }

    fn set_token(
        &self,
        state: &mut PoolState,
        org_uuid: &str,
        capabilities: Option<Vec<String>>,
        token: OAuthToken,
    ) {
        state.refreshing.remove(org_uuid);
        let Some(account) = state.accounts.get_mut(org_uuid) else {
            return;
        };
        account.oauth_token = Some(token);
        if let Some(capabilities) = capabilities {
            account.capabilities = capabilities;
        }
        account.recompute_auth_type();
        info!("Stored OAuth token for account {}", account.ellipse());
        self.save(state);
    }

    fn refresh_failed(&self, state: &mut PoolState, org_uuid: &str) {
        state.refreshing.remove(org_uuid);
        let Some(account) = state.accounts.get_mut(org_uuid) else {
            return;
        };
        match account.auth_type {
            AuthType::Both => {
                warn!(
                    "Refresh failed for {}, downgrading to cookie-only",
                    account.ellipse()
                );
                account.oauth_token = None;
                account.recompute_auth_type();
            }
            _ => {
                warn!("Refresh failed for {}, marking invalid", account.ellipse());
                account.status = AccountStatus::Invalid;
                account.resets_at = None;
            }
        }
        self.save(state);
    }

    /// One background pass: recover cooled-down accounts, kick refreshes
    fn tick(&self, state: &mut PoolState, myself: &ActorRef<PoolMessage>) {
        let now = Utc::now();
        let mut recovered = false;
        for account in state.accounts.values_mut() {
            if account.status == AccountStatus::RateLimited
                && account.resets_at.is_some_and(|t| now >= t)
            {
                info!("Recovered rate-limited account {}", account.ellipse());
                account.restore();
                recovered = true;
            }
        }
        if recovered {
            self.save(state);
            Self::log(state);
        }
        let due = state
            .accounts
            .values()
            .filter(|a| {
                a.oauth_token
                    .as_ref()
                    .is_some_and(|t| t.expires_within(TOKEN_REFRESH_WINDOW_SECS))
            })
            .filter(|a| !state.refreshing.contains(&a.organization_uuid))
            .filter_map(|a| {
                a.oauth_token
                    .as_ref()
                    .map(|t| (a.organization_uuid.to_owned(), t.refresh_token.to_owned()))
            })
            .collect::<Vec<_>>();
        for (org, refresh_token) in due {
            state.refreshing.insert(org.to_owned());
            let oauth = self.oauth.to_owned();
            let myself = myself.to_owned();
            tokio::spawn(async move {
                info!("Refreshing OAuth token for {}", &org[..8.min(org.len())]);
                let message = match oauth.refresh_access_token(&refresh_token).await {
                    Ok(token) => PoolMessage::SetToken(org, None, token),
                    Err(e) => {
                        error!("Token refresh failed: {e}");
                        PoolMessage::RefreshFailed(org)
                    }
                };
                let _ = myself.cast(message);
            });
        }
    }

    fn status(state: &PoolState) -> PoolStatus {
        let count = |status: AccountStatus| {
            state
                .accounts
                .values()
                .filter(|a| a.status == status)
                .count()
        };
        PoolStatus {
            total_accounts: state.accounts.len(),
            valid_accounts: count(AccountStatus::Valid),
            rate_limited_accounts: count(AccountStatus::RateLimited),
            invalid_accounts: count(AccountStatus::Invalid),
            active_sessions: state.session_index.len(),
        }
    }
}

impl Actor for AccountActor {
    type Msg = PoolMessage;
    type State = PoolState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _arguments: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let accounts = Self::load(self.persist);
        let cookie_index = accounts
            .iter()
            .filter_map(|(org, a)| {
                a.cookie_value
                    .as_ref()
                    .map(|c| (c.to_owned(), org.to_owned()))
            })
            .collect();
        let state = PoolState {
            accounts,
            cookie_index,
            session_index: HashMap::new(),
            account_sessions: HashMap::new(),
            refreshing: HashSet::new(),
        };
        Self::log(&state);
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Insert(seed, reply) => {
                reply.send(self.insert(state, seed))?;
            }
            PoolMessage::Remove(org_uuid, reply) => {
                reply.send(self.remove(state, &org_uuid))?;
            }
            PoolMessage::AcquireSession(session_id, filter, reply) => {
                reply.send(self.acquire_session(state, session_id, filter))?;
            }
            PoolMessage::AcquireOauth(filter, reply) => {
                reply.send(self.acquire_oauth(state, filter))?;
            }
            PoolMessage::AcquireById(org_uuid, reply) => {
                reply.send(self.acquire_by_id(state, &org_uuid))?;
            }
            PoolMessage::ReleaseSession(session_id) => {
                Self::unbind_session(state, &session_id);
            }
            PoolMessage::Touch(org_uuid) => {
                if let Some(account) = state.accounts.get_mut(&org_uuid) {
                    account.last_used = Utc::now();
                }
            }
            PoolMessage::Report(org_uuid, verdict) => {
                self.report(state, &org_uuid, verdict);
            }
            PoolMessage::SetToken(org_uuid, capabilities, token) => {
                self.set_token(state, &org_uuid, capabilities, token);
            }
            PoolMessage::RefreshFailed(org_uuid) => {
                self.refresh_failed(state, &org_uuid);
            }
            PoolMessage::Tick => {
                self.tick(state, &myself);
            }
            PoolMessage::List(reply) => {
                let mut accounts = state.accounts.values().cloned().collect::<Vec<_>>();
                accounts.sort_by(|a, b| a.organization_uuid.cmp(&b.organization_uuid));
                reply.send(accounts)?;
            }
            PoolMessage::Status(reply) => {
                reply.send(Self::status(state))?;
            }
        }
        Ok(())
    }
}

/// Handle for interacting with the account pool actor
#[derive(Clone)]
pub struct AccountPoolHandle {
    actor_ref: ActorRef<PoolMessage>,
    oauth: OauthAuthenticator,
}

fn actor_error(e: impl std::fmt::Display) -> CloverError {
    CloverError::Ractor {
        loc: Location::generate(),
        msg: format!("account pool actor unavailable: {e}"),
    }
}

impl AccountPoolHandle {
    /// Spawn the pool actor with persistence and the background ticker
    pub async fn start() -> Result<Self, CloverError> {
        Self::spawn(true, true).await
    }

    /// Spawn a pool with no persistence and no ticker, for tests
    pub async fn start_in_memory() -> Result<Self, CloverError> {
        Self::spawn(false, false).await
    }

    async fn spawn(persist: bool, ticker: bool) -> Result<Self, CloverError> {
        let oauth = OauthAuthenticator::new()?;
        let (actor_ref, _join_handle) = Actor::spawn(
            None,
            AccountActor {
                oauth: oauth.to_owned(),
                persist,
            },
            (),
        )
        .await
        .map_err(actor_error)?;
        let handle = Self { actor_ref, oauth };
        if ticker {
            handle.spawn_ticker();
        }
        Ok(handle)
    }

    fn spawn_ticker(&self) {
        let actor_ref = self.actor_ref.to_owned();
        tokio::spawn(async move {
            let period = CLOVER_CONFIG.load().account_task_interval.max(1);
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(period));
            interval.tick().await;
            loop {
                interval.tick().await;
                if actor_ref.cast(PoolMessage::Tick).is_err() {
                    break;
                }
            }
        });
    }

    /// Add or merge an account.
    ///
    /// A fresh cookie without an organization goes through organization
    /// discovery first; a resulting cookie-only account gets an
    /// asynchronous OAuth upgrade attempt.
    pub async fn add(
        &self,
        cookie: Option<String>,
        oauth: Option<OAuthToken>,
        mut org_uuid: Option<String>,
        mut capabilities: Option<Vec<String>>,
    ) -> Result<Account, CloverError> {
        if let Some(ref cookie) = cookie
            && org_uuid.is_none()
        {
            match self.oauth.get_organization_info(cookie).await {
                Ok((uuid, discovered)) => {
                    org_uuid = Some(uuid);
                    capabilities = capabilities.or(Some(discovered));
                }
                Err(e) => warn!("Organization discovery failed: {e}"),
            }
        }
        let seed = AccountSeed {
            cookie: cookie.to_owned(),
            oauth,
            org_uuid,
            capabilities,
        };
        let account = ractor::call!(self.actor_ref, PoolMessage::Insert, seed)
            .map_err(actor_error)??;

        if account.auth_type == AuthType::CookieOnly
            && let Some(cookie) = cookie
        {
            let this = self.to_owned();
            let org = account.organization_uuid.to_owned();
            tokio::spawn(async move {
                match this.oauth.authenticate(&cookie).await {
                    Ok((_, capabilities, token)) => {
                        let _ = this
                            .actor_ref
                            .cast(PoolMessage::SetToken(org, Some(capabilities), token));
                    }
                    Err(e) => {
                        warn!("OAuth upgrade failed for {}: {e}", &org[..8.min(org.len())]);
                    }
                }
            });
        }
        Ok(account)
    }

    pub async fn remove(&self, org_uuid: String) -> Result<(), CloverError> {
        ractor::call!(self.actor_ref, PoolMessage::Remove, org_uuid).map_err(actor_error)?
    }

    pub async fn acquire_session(
        &self,
        session_id: String,
        filter: AccountFilter,
    ) -> Result<Account, CloverError> {
        ractor::call!(
            self.actor_ref,
            PoolMessage::AcquireSession,
            session_id,
            filter
        )
        .map_err(actor_error)?
    }

    pub async fn acquire_oauth(&self, filter: AccountFilter) -> Result<Account, CloverError> {
        ractor::call!(self.actor_ref, PoolMessage::AcquireOauth, filter).map_err(actor_error)?
    }

    pub async fn acquire_by_id(&self, org_uuid: String) -> Result<Option<Account>, CloverError> {
        ractor::call!(self.actor_ref, PoolMessage::AcquireById, org_uuid).map_err(actor_error)
    }

    pub async fn release_session(&self, session_id: String) -> Result<(), CloverError> {
        ractor::cast!(self.actor_ref, PoolMessage::ReleaseSession(session_id))
            .map_err(actor_error)
    }

    pub async fn touch(&self, org_uuid: String) -> Result<(), CloverError> {
        ractor::cast!(self.actor_ref, PoolMessage::Touch(org_uuid)).map_err(actor_error)
    }

    /// Scoped-borrow exit: classify the attempt's error and mutate the
    /// borrowed account accordingly
    pub async fn report(&self, org_uuid: &str, error: &CloverError) {
        let Some(verdict) = Verdict::of(error) else {
            return;
        };
        let _ = ractor::cast!(
            self.actor_ref,
            PoolMessage::Report(org_uuid.to_owned(), verdict)
        );
    }

    pub async fn set_token(&self, org_uuid: String, token: OAuthToken) -> Result<(), CloverError> {
        ractor::cast!(self.actor_ref, PoolMessage::SetToken(org_uuid, None, token))
            .map_err(actor_error)
    }

    pub async fn tick(&self) -> Result<(), CloverError> {
        ractor::cast!(self.actor_ref, PoolMessage::Tick).map_err(actor_error)
    }

    pub async fn list(&self) -> Result<Vec<Account>, CloverError> {
        ractor::call!(self.actor_ref, PoolMessage::List).map_err(actor_error)
    }

    pub async fn status(&self) -> Result<PoolStatus, CloverError> {
        ractor::call!(self.actor_ref, PoolMessage::Status).map_err(actor_error)
    }

    pub fn authenticator(&self) -> &OauthAuthenticator {
        &self.oauth
    }

    pub async fn stop(&self) {
        self.actor_ref.stop(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_in: i64) -> OAuthToken {
        OAuthToken {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        }
    }

    async fn pool_with_oauth_accounts(n: usize) -> (AccountPoolHandle, Vec<String>) {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        let mut orgs = vec![];
        for i in 0..n {
            let org = format!("org-{i:02}");
            pool.add(None, Some(token(3600)), Some(org.to_owned()), None)
                .await
                .unwrap();
            orgs.push(org);
        }
        (pool, orgs)
    }

    #[tokio::test]
    async fn add_requires_some_credential() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        assert!(pool.add(None, None, None, None).await.is_err());
    }

    #[tokio::test]
    async fn add_merges_into_existing_org() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        pool.add(None, Some(token(3600)), Some("org-a".to_string()), None)
            .await
            .unwrap();
        let merged = pool
            .add(
                Some("cookie-a".to_string()),
                None,
                Some("org-a".to_string()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(merged.auth_type, AuthType::Both);
        assert_eq!(pool.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oauth_selection_prefers_oldest_last_used() {
        let (pool, orgs) = pool_with_oauth_accounts(2).await;
        // make org-00 the most recently used
        pool.touch(orgs[0].to_owned()).await.unwrap();
        let picked = pool.acquire_oauth(AccountFilter::default()).await.unwrap();
        assert_eq!(picked.organization_uuid, orgs[1]);
    }

    #[tokio::test]
    async fn rate_limit_report_and_recovery() {
        let (pool, orgs) = pool_with_oauth_accounts(1).await;
        let resets_at = Utc::now() - Duration::seconds(1);
        pool.report(&orgs[0], &CloverError::ClaudeRateLimited { resets_at })
            .await;
        // report is a cast; synchronize on a call
        let listed = pool.list().await.unwrap();
        assert_eq!(listed[0].status, AccountStatus::RateLimited);
        assert!(listed[0].resets_at.is_some());
        assert!(
            pool.acquire_oauth(AccountFilter::default()).await.is_err(),
            "rate-limited account must not be selected"
        );
        // reset time already passed, one tick recovers it
        pool.tick().await.unwrap();
        let listed = pool.list().await.unwrap();
        assert_eq!(listed[0].status, AccountStatus::Valid);
        assert!(listed[0].resets_at.is_none());
        assert!(pool.acquire_oauth(AccountFilter::default()).await.is_ok());
    }

    #[tokio::test]
    async fn session_selection_balances_then_sticks() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        for org in ["org-a", "org-b"] {
            pool.add(
                Some(format!("cookie-{org}")),
                None,
                Some(org.to_string()),
                None,
            )
            .await
            .unwrap();
        }
        let first = pool
            .acquire_session("s1".to_string(), AccountFilter::default())
            .await
            .unwrap();
        let second = pool
            .acquire_session("s2".to_string(), AccountFilter::default())
            .await
            .unwrap();
        assert_ne!(
            first.organization_uuid, second.organization_uuid,
            "least-loaded selection spreads sessions"
        );
        let again = pool
            .acquire_session("s1".to_string(), AccountFilter::default())
            .await
            .unwrap();
        assert_eq!(first.organization_uuid, again.organization_uuid);
        pool.release_session("s1".to_string()).await.unwrap();
        let status = pool.status().await.unwrap();
        assert_eq!(status.active_sessions, 1);
    }

    #[tokio::test]
    async fn disabled_report_invalidates() {
        let (pool, orgs) = pool_with_oauth_accounts(1).await;
        pool.report(&orgs[0], &CloverError::OrganizationDisabled)
            .await;
        let listed = pool.list().await.unwrap();
        assert_eq!(listed[0].status, AccountStatus::Invalid);
        assert!(pool.acquire_oauth(AccountFilter::default()).await.is_err());
    }

    #[tokio::test]
    async fn max_filter_excludes_non_max_accounts() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        pool.add(
            None,
            Some(token(3600)),
            Some("org-basic".to_string()),
            Some(vec!["chat".to_string()]),
        )
        .await
        .unwrap();
        assert!(pool.acquire_oauth(AccountFilter::max_only()).await.is_err());
        pool.add(
            None,
            Some(token(3600)),
            Some("org-max".to_string()),
            Some(vec!["chat".to_string(), "claude_max".to_string()]),
        )
        .await
        .unwrap();
        let picked = pool.acquire_oauth(AccountFilter::max_only()).await.unwrap();
        assert_eq!(picked.organization_uuid, "org-max");
    }

    #[tokio::test]
    async fn acquire_by_id_requires_valid_oauth() {
        let (pool, orgs) = pool_with_oauth_accounts(1).await;
        assert!(
            pool.acquire_by_id(orgs[0].to_owned())
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            pool.acquire_by_id("missing".to_string())
                .await
                .unwrap()
                .is_none()
        );
        pool.report(&orgs[0], &CloverError::OrganizationDisabled)
            .await;
        let _ = pool.list().await.unwrap();
        assert!(
            pool.acquire_by_id(orgs[0].to_owned())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn remove_purges_bindings() {
        let pool = AccountPoolHandle::start_in_memory().await.unwrap();
        pool.add(
            Some("cookie-x".to_string()),
            None,
            Some("org-x".to_string()),
            None,
        )
        .await
        .unwrap();
        pool.acquire_session("s1".to_string(), AccountFilter::default())
            .await
            .unwrap();
        pool.remove("org-x".to_string()).await.unwrap();
        let status = pool.status().await.unwrap();
        assert_eq!(status.total_accounts, 0);
        assert_eq!(status.active_sessions, 0);
    }
}

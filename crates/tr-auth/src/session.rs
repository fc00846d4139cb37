use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{MutexGuard, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::AuthClient;
use crate::config::{AuthConfig, SLOW_DOWN_STEP};
use crate::errors::{AuthError, Result};
use crate::models::MinecraftProfile;
use crate::profile_cache::ProfileCache;
use crate::store::TokenStore;
use crate::tokens::{self, DeviceCodeChallenge, PollOutcome, TokenKind, TokenSet};

/// Where the session is in the sign-in flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    /// Waiting for the user to enter the code at the verification URI
    AwaitingDeviceVerification(DeviceCodeChallenge),
    Polling,
    /// Running the XBL → XSTS → Minecraft exchanges
    Exchanging,
    SignedIn,
}

/// The signed-in account of one launcher process
///
/// Owns the token store and profile cache and drives the device-code flow.
/// The stored access token is always a Minecraft access token; the refresh
/// token is the Microsoft one.
///
/// Every write of tokens, profile or state happens under `commit_lock`.
/// Signing out bumps `generation`, so work that started before the sign-out
/// sees the change when it reaches the lock and drops its results.
pub struct AuthSession {
    client: AuthClient,
    store: Arc<dyn TokenStore>,
    profiles: Arc<ProfileCache>,
    /// Cache of the stored expiry; `None` means "ask the store"
    expires_at: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
    commit_lock: tokio::sync::Mutex<()>,
    active_sign_in: Mutex<Option<CancellationToken>>,
    sign_in_lock: tokio::sync::Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<AuthState>,
}

impl AuthSession {
    pub fn new(client: AuthClient, store: Arc<dyn TokenStore>) -> Self {
        let profiles = Arc::new(ProfileCache::new(client.clone()));
        let (state, _) = watch::channel(AuthState::SignedOut);

        Self {
            client,
            store,
            profiles,
            expires_at: Mutex::new(None),
            generation: AtomicU64::new(0),
            commit_lock: tokio::sync::Mutex::new(()),
            active_sign_in: Mutex::new(None),
            sign_in_lock: tokio::sync::Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
            state,
        }
    }

    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    fn config(&self) -> &AuthConfig {
        self.client.config()
    }

    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: AuthState) {
        debug!("Auth state -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Run the device-code sign-in
    ///
    /// `on_challenge` is called once with the code to show the user. Polling
    /// and the token exchanges stop when `cancel` fires or [`AuthSession::sign_out`]
    /// is called. Any failure signs the session out and removes stored tokens
    /// before the error is returned. A second call while one is running fails
    /// with [`AuthError::SignInInProgress`].
    pub async fn sign_in<F>(
        &self,
        cancel: CancellationToken,
        on_challenge: F,
    ) -> Result<Option<MinecraftProfile>>
    where
        F: FnOnce(&DeviceCodeChallenge) + Send,
    {
        let _guard = self
            .sign_in_lock
            .try_lock()
            .map_err(|_| AuthError::SignInInProgress)?;

        let cancel = cancel.child_token();
        self.set_active_sign_in(Some(cancel.clone()));
        let result = self.run_sign_in(&cancel, on_challenge).await;
        self.set_active_sign_in(None);

        match result {
            Ok(profile) => Ok(profile),
            Err(e) => {
                warn!("Sign-in failed: {}", e);
                self.clear_local().await;
                Err(e)
            }
        }
    }

    async fn run_sign_in<F>(
        &self,
        cancel: &CancellationToken,
        on_challenge: F,
    ) -> Result<Option<MinecraftProfile>>
    where
        F: FnOnce(&DeviceCodeChallenge) + Send,
    {
        let challenge = self.client.request_device_code().await?;
        info!("Device code issued, waiting for user verification");
        self.set_state(AuthState::AwaitingDeviceVerification(challenge.clone()));
        on_challenge(&challenge);

        let tokens = self.poll_until_authorized(&challenge, cancel).await?;

        self.set_state(AuthState::Exchanging);
        let mc_token = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            mc_token = self.client.exchange_chain(&tokens.access_token) => mc_token?,
        };

        let generation = {
            let _commit = self.commit_lock.lock().await;
            if cancel.is_cancelled() {
                return Err(cancelled());
            }
            self.persist(&mc_token, &tokens).await?;
            self.generation()
        };

        let Some(profile) = self.publish_profile(generation, &mc_token).await else {
            return Err(cancelled());
        };
        info!(
            "Signed in as {}",
            profile.as_ref().map(|p| p.name.as_str()).unwrap_or("<no license>")
        );

        Ok(profile)
    }

    async fn poll_until_authorized(
        &self,
        challenge: &DeviceCodeChallenge,
        cancel: &CancellationToken,
    ) -> Result<TokenSet> {
        let poll = &self.config().poll;
        let retry = &self.config().retry;

        let mut interval = poll.interval_override.unwrap_or(challenge.poll_interval);
        let deadline = Instant::now() + challenge.expires_in;
        let mut attempts: u32 = 0;
        let mut transport_failures: u32 = 0;

        self.set_state(AuthState::Polling);

        loop {
            if poll.max_attempts.is_some_and(|max| attempts >= max) {
                warn!("Gave up polling after {} attempts", attempts);
                return Err(AuthError::PollTimedOut);
            }

            wait_or_cancel(interval, cancel).await?;
            if Instant::now() >= deadline {
                warn!("Device code expired before verification completed");
                return Err(AuthError::PollTimedOut);
            }

            attempts += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                outcome = self.client.poll_for_token(challenge) => outcome,
            };

            match outcome {
                Ok(PollOutcome::Authorized(tokens)) => {
                    info!("Device code authorized after {} poll(s)", attempts);
                    return Ok(tokens);
                }
                Ok(PollOutcome::Pending) => {
                    transport_failures = 0;
                }
                Ok(PollOutcome::SlowDown) => {
                    transport_failures = 0;
                    interval += SLOW_DOWN_STEP;
                    debug!("Poll interval raised to {:?}", interval);
                }
                Err(AuthError::Network(e)) if transport_failures < retry.max_retries => {
                    transport_failures += 1;
                    let delay = retry.delay_for(transport_failures);
                    warn!(
                        "Poll attempt failed ({}), retry {}/{} in {:?}",
                        e, transport_failures, retry.max_retries, delay
                    );
                    wait_or_cancel(delay, cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a Minecraft access token that is not about to expire
    ///
    /// The expiry is kept beside the tokens, so it survives a restart. Refreshes
    /// first when inside the refresh buffer or when no expiry is stored.
    pub async fn ensure_valid_access_token(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        let token = self
            .load_token(TokenKind::Access)
            .await?
            .ok_or(AuthError::NotSignedIn)?;

        if !self.needs_refresh().await {
            return Ok(token);
        }

        debug!("Access token expired or about to expire");
        self.refresh_locked().await
    }

    /// Force a refresh
    ///
    /// On failure both stored tokens and the cached profile are discarded and
    /// the error is wrapped in [`AuthError::RefreshFailed`].
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<String> {
        let generation = self.generation();
        let refresh_token = self
            .load_token(TokenKind::Refresh)
            .await?
            .ok_or(AuthError::NotSignedIn)?;

        let result = self.refresh_chain(&refresh_token).await;

        let Some(_commit) = self.commit_guard(generation).await else {
            debug!("Signed out during refresh, dropping the result");
            return Err(AuthError::NotSignedIn);
        };

        let result = match result {
            Ok((mc_token, tokens)) => self.persist(&mc_token, &tokens).await.map(|()| mc_token),
            Err(e) => Err(e),
        };

        match result {
            Ok(mc_token) => {
                info!("Refreshed Minecraft access token");
                self.set_state(AuthState::SignedIn);
                Ok(mc_token)
            }
            Err(e) => {
                warn!("Token refresh failed, clearing credentials: {}", e);
                self.clear_committed().await;
                Err(AuthError::RefreshFailed {
                    source: Box::new(e),
                })
            }
        }
    }

    async fn refresh_chain(&self, refresh_token: &str) -> Result<(String, TokenSet)> {
        let tokens = self.client.refresh_access_token(refresh_token).await?;
        let mc_token = self.client.exchange_chain(&tokens.access_token).await?;
        Ok((mc_token, tokens))
    }

    /// Restore a stored session at startup
    ///
    /// Returns `Ok(None)` when nothing is stored or the session is signed out
    /// before the profile arrives.
    pub async fn resume(&self) -> Result<Option<MinecraftProfile>> {
        let generation = self.generation();
        if self.load_token(TokenKind::Refresh).await?.is_none() {
            debug!("No stored session to resume");
            self.set_state(AuthState::SignedOut);
            return Ok(None);
        }

        let token = self.ensure_valid_access_token().await?;
        Ok(self.publish_profile(generation, &token).await.flatten())
    }

    /// Re-fetch the profile with a valid token and update the cache
    pub async fn profile(&self) -> Result<Option<MinecraftProfile>> {
        let generation = self.generation();
        let token = self.ensure_valid_access_token().await?;
        self.publish_profile(generation, &token)
            .await
            .ok_or(AuthError::NotSignedIn)
    }

    /// Fetch and publish the profile unless a sign-out happened since `generation`
    ///
    /// Returns `None` when the result was dropped.
    async fn publish_profile(
        &self,
        generation: u64,
        mc_token: &str,
    ) -> Option<Option<MinecraftProfile>> {
        let profile = self.profiles.fetch(mc_token).await;

        let Some(_commit) = self.commit_guard(generation).await else {
            debug!("Signed out while fetching the profile");
            return None;
        };
        self.profiles.publish(profile.clone());
        self.set_state(AuthState::SignedIn);
        Some(profile)
    }

    pub async fn is_signed_in(&self) -> bool {
        matches!(self.load_token(TokenKind::Access).await, Ok(Some(_)))
    }

    /// Delete stored tokens and forget the profile; never fails
    ///
    /// A sign-in in progress is cancelled, and refreshes or profile fetches
    /// already in flight do not write their results back.
    pub async fn sign_out(&self) {
        let active = self.active_sign_in.lock().ok().and_then(|active| active.clone());
        if let Some(cancel) = active {
            cancel.cancel();
        }

        self.clear_local().await;
        info!("Signed out");
    }

    fn set_active_sign_in(&self, cancel: Option<CancellationToken>) {
        if let Ok(mut active) = self.active_sign_in.lock() {
            *active = cancel;
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Take the commit lock, or `None` if a sign-out happened since `generation`
    async fn commit_guard(&self, generation: u64) -> Option<MutexGuard<'_, ()>> {
        let guard = self.commit_lock.lock().await;
        (self.generation() == generation).then_some(guard)
    }

    /// Caller holds the commit lock
    async fn persist(&self, mc_token: &str, tokens: &TokenSet) -> Result<()> {
        self.store.save(TokenKind::Access, mc_token).await?;
        if let Some(refresh_token) = &tokens.refresh_token {
            self.store.save(TokenKind::Refresh, refresh_token).await?;
        }
        self.store
            .save(TokenKind::ExpiresAt, &tokens.expires_at_millis().to_string())
            .await?;

        if let Ok(mut expires_at) = self.expires_at.lock() {
            *expires_at = Some(tokens.expires_at);
        }
        Ok(())
    }

    /// Corrupt tokens count as absent
    async fn load_token(&self, kind: TokenKind) -> Result<Option<String>> {
        match self.store.load(kind).await {
            Err(AuthError::CorruptToken) => {
                warn!("Ignoring unreadable {} token", kind);
                Ok(None)
            }
            other => other,
        }
    }

    /// Missing or unreadable expiry counts as expired
    async fn needs_refresh(&self) -> bool {
        let cached = self.expires_at.lock().ok().and_then(|e| *e);
        let expires_at = match cached {
            Some(expires_at) => Some(expires_at),
            None => self.load_expiry().await,
        };

        match expires_at {
            Some(expires_at) => {
                tokens::needs_refresh(expires_at, Utc::now(), self.config().refresh_buffer)
            }
            None => true,
        }
    }

    async fn load_expiry(&self) -> Option<DateTime<Utc>> {
        let stored = self.load_token(TokenKind::ExpiresAt).await.ok().flatten()?;
        let Some(expires_at) = TokenSet::parse_expiry(&stored) else {
            warn!("Ignoring malformed stored token expiry");
            return None;
        };

        if let Ok(mut cached) = self.expires_at.lock() {
            *cached = Some(expires_at);
        }
        Some(expires_at)
    }

    async fn clear_local(&self) {
        let _commit = self.commit_lock.lock().await;
        self.clear_committed().await;
    }

    /// Caller holds the commit lock. Profile first, so observers never see a
    /// profile without a token.
    async fn clear_committed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.profiles.clear();
        self.store.clear().await;
        if let Ok(mut expires_at) = self.expires_at.lock() {
            *expires_at = None;
        }
        self.set_state(AuthState::SignedOut);
    }
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("state", &self.state())
            .field("profiles", &self.profiles)
            .finish_non_exhaustive()
    }
}

async fn wait_or_cancel(duration: std::time::Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

fn cancelled() -> AuthError {
    info!("Sign-in cancelled");
    AuthError::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Endpoints, PollPolicy, RetryPolicy};
    use crate::file_store::FileTokenStore;
    use crate::key_manager::KdfParams;
    use crate::secret::StaticSecretProvider;
    use crate::store::MemoryTokenStore;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/common/oauth2/v2.0/token";

    fn test_config(server: &MockServer) -> AuthConfig {
        let mut config = AuthConfig::new("test-client")
            .with_endpoints(Endpoints::with_base(&server.uri()).unwrap())
            .with_poll_policy(PollPolicy {
                max_attempts: None,
                interval_override: Some(Duration::from_millis(10)),
            });
        config.retry = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
        };
        config
    }

    fn session_with(config: AuthConfig, store: Arc<MemoryTokenStore>) -> AuthSession {
        AuthSession::new(AuthClient::new(config).unwrap(), store)
    }

    fn session_for(server: &MockServer, store: Arc<MemoryTokenStore>) -> AuthSession {
        session_with(test_config(server), store)
    }

    async fn mount_device_code(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "dc1",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://microsoft.com/link",
                "expires_in": 900,
                "interval": 5
            })))
            .mount(server)
            .await;
    }

    async fn mount_pending(server: &MockServer, times: Option<u64>) {
        let mock = Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("device_code=dc1"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "authorization_pending"})),
            );
        match times {
            Some(n) => mock.up_to_n_times(n).expect(n).mount(server).await,
            None => mock.mount(server).await,
        }
    }

    async fn mount_authorized(server: &MockServer, expires_in: i64) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("device_code=dc1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "msat1",
                "refresh_token": "msrt1",
                "expires_in": expires_in
            })))
            .mount(server)
            .await;
    }

    /// XBL → XSTS → MC for Microsoft token `msat{n}`, yielding `mc{n}`
    async fn mount_chain(server: &MockServer, n: u32) {
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .and(body_json(json!({
                "Properties": {
                    "AuthMethod": "RPS",
                    "SiteName": "user.auth.xboxlive.com",
                    "RpsTicket": format!("d=msat{n}")
                },
                "RelyingParty": "http://auth.xboxlive.com",
                "TokenType": "JWT"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": format!("xbl{n}"),
                "DisplayClaims": {"xui": [{"uhs": "hash1"}]}
            })))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xsts/authorize"))
            .and(body_json(json!({
                "Properties": {"SandboxId": "RETAIL", "UserTokens": [format!("xbl{n}")]},
                "RelyingParty": "rp://api.minecraftservices.com/",
                "TokenType": "JWT"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": format!("xsts{n}"),
                "DisplayClaims": {"xui": [{"uhs": "hash1"}]}
            })))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/authentication/login_with_xbox"))
            .and(body_json(json!({"identityToken": format!("XBL3.0 x=hash1;xsts{n}")})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": format!("mc{n}"),
                "expires_in": 86400
            })))
            .mount(server)
            .await;
    }

    async fn mount_profile(server: &MockServer) {
        mount_profile_after(server, Duration::ZERO).await;
    }

    async fn mount_profile_after(server: &MockServer, delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/minecraft/profile"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "id": "uuid1",
                        "name": "Steve",
                        "skins": [],
                        "capes": []
                    }))
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }

    async fn mount_refresh(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "msat2",
                "refresh_token": "msrt2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    async fn signed_in_session(server: &MockServer, expires_in: i64) -> (AuthSession, Arc<MemoryTokenStore>) {
        mount_device_code(server).await;
        mount_authorized(server, expires_in).await;
        mount_chain(server, 1).await;
        mount_profile(server).await;

        let store = Arc::new(MemoryTokenStore::new());
        let session = session_for(server, store.clone());
        session
            .sign_in(CancellationToken::new(), |_| {})
            .await
            .unwrap();
        (session, store)
    }

    #[tokio::test]
    async fn test_sign_in_polls_through_pending_and_exchanges() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_pending(&server, Some(2)).await;
        mount_authorized(&server, 3600).await;
        mount_chain(&server, 1).await;
        mount_profile(&server).await;

        let store = Arc::new(MemoryTokenStore::new());
        let session = session_for(&server, store.clone());
        let shown = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&shown);

        let profile = session
            .sign_in(CancellationToken::new(), move |challenge| {
                *sink.lock().unwrap() = Some(challenge.clone());
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(profile.id, "uuid1");
        assert_eq!(profile.name, "Steve");

        let challenge = shown.lock().unwrap().clone().unwrap();
        assert_eq!(challenge.user_code, "ABCD-EFGH");
        assert_eq!(challenge.verification_uri, "https://microsoft.com/link");
        assert_eq!(challenge.poll_interval, Duration::from_secs(5));

        assert_eq!(store.load(TokenKind::Access).await.unwrap().as_deref(), Some("mc1"));
        assert_eq!(store.load(TokenKind::Refresh).await.unwrap().as_deref(), Some("msrt1"));
        assert_eq!(session.state(), AuthState::SignedIn);
        assert_eq!(session.profiles().name().as_deref(), Some("Steve"));
        assert!(session.is_signed_in().await);
    }

    #[tokio::test]
    async fn test_sign_in_reports_state_transitions() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_authorized(&server, 3600).await;
        mount_chain(&server, 1).await;
        mount_profile(&server).await;
        let session = session_for(&server, Arc::new(MemoryTokenStore::new()));

        let mut states = session.subscribe();
        assert_eq!(*states.borrow_and_update(), AuthState::SignedOut);

        let seen_awaiting = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&seen_awaiting);
        let watcher = session.subscribe();
        session
            .sign_in(CancellationToken::new(), move |_| {
                *flag.lock().unwrap() = matches!(
                    *watcher.borrow(),
                    AuthState::AwaitingDeviceVerification(_)
                );
            })
            .await
            .unwrap();

        assert!(*seen_awaiting.lock().unwrap());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), AuthState::SignedIn);
    }

    #[tokio::test]
    async fn test_denied_sign_in_clears_everything() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "authorization_declined"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        store.save(TokenKind::Access, "old-mc").await.unwrap();
        store.save(TokenKind::Refresh, "old-rt").await.unwrap();
        let session = session_for(&server, store.clone());

        let err = session
            .sign_in(CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Denied { ref reason } if reason == "authorization_declined"));
        assert!(store.load(TokenKind::Access).await.unwrap().is_none());
        assert!(store.load(TokenKind::Refresh).await.unwrap().is_none());
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_exchange_failure_signs_out() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_authorized(&server, 3600).await;
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": "xbl1",
                "DisplayClaims": {"xui": []}
            })))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        let session = session_for(&server, store.clone());

        let err = session
            .sign_in(CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::MissingClaims));
        assert!(!session.is_signed_in().await);
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_cancel_stops_polling() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_pending(&server, None).await;

        let session = session_for(&server, Arc::new(MemoryTokenStore::new()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let err = session
            .sign_in(cancel, move |_| trigger.cancel())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::Cancelled));
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_polling() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_pending(&server, Some(3)).await;

        let mut config = test_config(&server);
        config.poll.max_attempts = Some(3);
        let session = session_with(config, Arc::new(MemoryTokenStore::new()));

        let err = session
            .sign_in(CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::PollTimedOut));
    }

    #[tokio::test]
    async fn test_transport_failure_while_polling_is_retried() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"error": "authorization_pending"}))
                    .set_delay(Duration::from_secs(2)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_authorized(&server, 3600).await;
        mount_chain(&server, 1).await;
        mount_profile(&server).await;

        let mut config = test_config(&server);
        config.http_timeouts.request = Duration::from_millis(300);
        let store = Arc::new(MemoryTokenStore::new());
        let session = session_with(config, store.clone());

        let profile = session
            .sign_in(CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(profile.map(|p| p.name).as_deref(), Some("Steve"));
        assert_eq!(store.load(TokenKind::Access).await.unwrap().as_deref(), Some("mc1"));
    }

    #[tokio::test]
    async fn test_overlapping_sign_in_is_rejected() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_pending(&server, None).await;

        let session = Arc::new(session_for(&server, Arc::new(MemoryTokenStore::new())));
        let cancel = CancellationToken::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            async move {
                session
                    .sign_in(cancel, move |_| {
                        let _ = started_tx.send(());
                    })
                    .await
            }
        });

        started_rx.await.unwrap();
        let second = session.sign_in(CancellationToken::new(), |_| {}).await;
        assert!(matches!(second, Err(AuthError::SignInInProgress)));

        cancel.cancel();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(AuthError::Cancelled)));
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let (session, _store) = signed_in_session(&server, 3600).await;

        assert_eq!(session.ensure_valid_access_token().await.unwrap(), "mc1");
        assert_eq!(session.ensure_valid_access_token().await.unwrap(), "mc1");
    }

    #[tokio::test]
    async fn test_token_inside_buffer_is_refreshed() {
        let server = MockServer::start().await;
        mount_refresh(&server).await;
        mount_chain(&server, 2).await;
        let (session, store) = signed_in_session(&server, 30).await;

        assert_eq!(session.ensure_valid_access_token().await.unwrap(), "mc2");
        assert_eq!(store.load(TokenKind::Access).await.unwrap().as_deref(), Some("mc2"));
        assert_eq!(store.load(TokenKind::Refresh).await.unwrap().as_deref(), Some("msrt2"));

        // new expiry is an hour out
        assert_eq!(session.ensure_valid_access_token().await.unwrap(), "mc2");
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("refresh_token=bad-rt"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70000: The refresh token has expired"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryTokenStore::new());
        store.save(TokenKind::Access, "old-mc").await.unwrap();
        store.save(TokenKind::Refresh, "bad-rt").await.unwrap();
        let session = session_for(&server, store.clone());

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed { .. }));
        assert_eq!(err.status(), Some(reqwest::StatusCode::BAD_REQUEST));

        assert!(store.load(TokenKind::Access).await.unwrap().is_none());
        assert!(store.load(TokenKind::Refresh).await.unwrap().is_none());
        assert!(matches!(
            session.ensure_valid_access_token().await,
            Err(AuthError::NotSignedIn)
        ));
    }

    #[tokio::test]
    async fn test_not_signed_in() {
        let server = MockServer::start().await;
        let session = session_for(&server, Arc::new(MemoryTokenStore::new()));

        assert!(matches!(
            session.ensure_valid_access_token().await,
            Err(AuthError::NotSignedIn)
        ));
        assert!(matches!(session.refresh().await, Err(AuthError::NotSignedIn)));
        assert!(session.resume().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resume_refreshes_unknown_expiry() {
        let server = MockServer::start().await;
        mount_refresh(&server).await;
        mount_chain(&server, 2).await;
        mount_profile(&server).await;

        let store = Arc::new(MemoryTokenStore::new());
        store.save(TokenKind::Access, "stale-mc").await.unwrap();
        store.save(TokenKind::Refresh, "msrt1").await.unwrap();
        let session = session_for(&server, store.clone());

        let profile = session.resume().await.unwrap().unwrap();

        assert_eq!(profile.name, "Steve");
        assert_eq!(store.load(TokenKind::Access).await.unwrap().as_deref(), Some("mc2"));
        assert_eq!(session.state(), AuthState::SignedIn);
    }

    #[tokio::test]
    async fn test_stored_expiry_avoids_refresh_after_restart() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_authorized(&server, 3600).await;
        mount_chain(&server, 1).await;
        mount_profile(&server).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let secret = StaticSecretProvider::new("pw");
        let params = KdfParams::new(1024, 1, 1);

        let store = FileTokenStore::open_with_params(temp.path(), &secret, params)
            .await
            .unwrap();
        let session = AuthSession::new(AuthClient::new(test_config(&server)).unwrap(), Arc::new(store));
        session.sign_in(CancellationToken::new(), |_| {}).await.unwrap();
        drop(session);

        let store = FileTokenStore::open_with_params(temp.path(), &secret, params)
            .await
            .unwrap();
        let restarted = AuthSession::new(AuthClient::new(test_config(&server)).unwrap(), Arc::new(store));

        assert_eq!(restarted.ensure_valid_access_token().await.unwrap(), "mc1");
    }

    #[tokio::test]
    async fn test_sign_out_during_resume_is_not_undone() {
        let server = MockServer::start().await;
        mount_profile_after(&server, Duration::from_millis(500)).await;

        let store = Arc::new(MemoryTokenStore::new());
        store.save(TokenKind::Access, "mc1").await.unwrap();
        store.save(TokenKind::Refresh, "msrt1").await.unwrap();
        let expires_at = Utc::now() + chrono::Duration::hours(1);
        store
            .save(TokenKind::ExpiresAt, &expires_at.timestamp_millis().to_string())
            .await
            .unwrap();
        let session = Arc::new(session_for(&server, store.clone()));

        let resuming = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.resume().await }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        session.sign_out().await;

        assert!(resuming.await.unwrap().unwrap().is_none());
        assert!(session.profiles().get().is_none());
        assert!(store.load(TokenKind::Access).await.unwrap().is_none());
        assert!(store.load(TokenKind::Refresh).await.unwrap().is_none());
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_sign_out_during_exchange_cancels_sign_in() {
        let server = MockServer::start().await;
        mount_device_code(&server).await;
        mount_authorized(&server, 3600).await;
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "Token": "xbl1",
                        "DisplayClaims": {"xui": [{"uhs": "hash1"}]}
                    }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;
        mount_profile(&server).await;

        let store = Arc::new(MemoryTokenStore::new());
        let session = Arc::new(session_for(&server, store.clone()));
        let mut states = session.subscribe();

        let signing_in = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.sign_in(CancellationToken::new(), |_| {}).await }
        });

        states
            .wait_for(|state| *state == AuthState::Exchanging)
            .await
            .unwrap();
        session.sign_out().await;

        let result = signing_in.await.unwrap();
        assert!(matches!(result, Err(AuthError::Cancelled)));
        assert!(store.load(TokenKind::Access).await.unwrap().is_none());
        assert!(store.load(TokenKind::Refresh).await.unwrap().is_none());
        assert!(session.profiles().get().is_none());
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_sign_out_clears_tokens_and_profile() {
        let server = MockServer::start().await;
        let (session, store) = signed_in_session(&server, 3600).await;

        let notified = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&notified);
        session.profiles().add_listener(move |profile| {
            sink.lock().unwrap().push(profile.is_some());
        });

        session.sign_out().await;
        session.sign_out().await;

        assert!(store.load(TokenKind::Access).await.unwrap().is_none());
        assert!(store.load(TokenKind::Refresh).await.unwrap().is_none());
        assert!(session.profiles().get().is_none());
        assert_eq!(*notified.lock().unwrap(), vec![false, false]);
        assert_eq!(session.state(), AuthState::SignedOut);
    }

    struct CorruptStore;

    #[async_trait::async_trait]
    impl TokenStore for CorruptStore {
        async fn save(&self, _kind: TokenKind, _plaintext: &str) -> Result<()> {
            Ok(())
        }

        async fn load(&self, _kind: TokenKind) -> Result<Option<String>> {
            Err(AuthError::CorruptToken)
        }

        async fn delete(&self, _kind: TokenKind) {}
    }

    #[tokio::test]
    async fn test_corrupt_token_counts_as_signed_out() {
        let server = MockServer::start().await;
        let client = AuthClient::new(test_config(&server)).unwrap();
        let session = AuthSession::new(client, Arc::new(CorruptStore));

        assert!(matches!(
            session.ensure_valid_access_token().await,
            Err(AuthError::NotSignedIn)
        ));
        assert!(!session.is_signed_in().await);
    }
}

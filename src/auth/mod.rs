pub mod callback;

use crate::api::{AuthorizationRequest, Authenticator, DeviceAuthorization, DevicePoll, TokenGrant};
use crate::config::AuthConfig;
use crate::db::Store;
use crate::error::ClientError;
use crate::models::{CredentialRecord, Platform, TokenPayload};
use callback::CallbackListener;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-platform authentication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Pending,
    Authenticated,
    Expired,
}

/// Result of a non-blocking check on an in-flight authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Success,
    Failed,
}

/// Bearer credential handed to every platform client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub platform: Platform,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

impl Session {
    fn from_record(record: &CredentialRecord) -> Self {
        Self {
            platform: record.platform,
            access_token: record.secret.access_token().to_string(),
            expires_at: record.expires_at,
            user_id: record.secret.user_id().map(String::from),
        }
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// What the user has to do to finish logging in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPrompt {
    Browser { url: String },
    Device { verification_uri: String, user_code: String },
}

enum PendingAuth {
    Redirect {
        state: String,
        code_verifier: String,
        redirect_uri: String,
    },
    Device(JoinHandle<Result<Session, ClientError>>),
}

struct Slot {
    state: AuthState,
    session: Option<Session>,
    pending: Option<PendingAuth>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: AuthState::Unauthenticated,
            session: None,
            pending: None,
        }
    }
}

/// Owns the authentication state of both platforms and the credential records
/// behind it. Sessions are reconstructed from the store and never shared as
/// process-wide globals; clients receive them per call.
pub struct SessionManager {
    store: Store,
    authenticators: HashMap<Platform, Arc<dyn Authenticator>>,
    slots: Mutex<HashMap<Platform, Slot>>,
    callback_timeout: Duration,
    exchange_timeout: Duration,
}

/// Turn a token grant into a credential record. A refresh response that omits
/// the refresh token or user id keeps the previous ones.
fn record_from_grant(platform: Platform, grant: TokenGrant, previous: Option<&TokenPayload>) -> CredentialRecord {
    let refresh_token = grant
        .refresh_token
        .or_else(|| previous.and_then(|p| p.refresh_token().map(String::from)));
    let user_id = grant
        .user_id
        .or_else(|| previous.and_then(|p| p.user_id().map(String::from)));
    CredentialRecord {
        platform,
        secret: TokenPayload::V1 {
            access_token: grant.access_token,
            token_type: grant.token_type,
            refresh_token,
            scope: grant.scope,
            user_id,
        },
        expires_at: Utc::now() + chrono::Duration::seconds(grant.expires_in),
    }
}

async fn persist_grant(
    store: &Store,
    platform: Platform,
    grant: TokenGrant,
    previous: Option<&TokenPayload>,
) -> Result<Session, ClientError> {
    let record = record_from_grant(platform, grant, previous);
    let session = Session::from_record(&record);
    store.blocking(move |s| s.save_credential(&record)).await?;
    Ok(session)
}

async fn poll_device_until_granted(
    auth: &dyn Authenticator,
    device: &DeviceAuthorization,
) -> Result<TokenGrant, ClientError> {
    let deadline = tokio::time::Instant::now() + device.expires_in;
    let mut interval = device.interval;
    loop {
        tokio::time::sleep(interval).await;
        if tokio::time::Instant::now() >= deadline {
            return Err(ClientError::auth(auth.platform(), "device code expired before it was approved"));
        }
        match auth.poll_device(device).await? {
            DevicePoll::Pending => continue,
            DevicePoll::SlowDown => {
                interval += Duration::from_secs(5);
                debug!("{}: device poll asked to slow down, interval now {:?}", auth.platform(), interval);
            }
            DevicePoll::Granted(grant) => return Ok(grant),
        }
    }
}

/// Host, port and path a redirect URI points the browser back to.
fn redirect_target(platform: Platform, redirect_uri: &str) -> Result<(SocketAddr, String), ClientError> {
    let url = url::Url::parse(redirect_uri)
        .map_err(|e| ClientError::auth(platform, format!("invalid redirect uri {:?}: {}", redirect_uri, e)))?;
    let host = url.host_str().unwrap_or("127.0.0.1");
    let port = url.port_or_known_default().unwrap_or(80);
    let addr = (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
        .ok_or_else(|| ClientError::auth(platform, format!("cannot resolve redirect host {}", host)))?;
    Ok((addr, url.path().to_string()))
}

impl SessionManager {
    pub fn new(store: Store, authenticators: Vec<Arc<dyn Authenticator>>, cfg: &AuthConfig) -> Self {
        Self {
            store,
            authenticators: authenticators.into_iter().map(|a| (a.platform(), a)).collect(),
            slots: Mutex::new(HashMap::new()),
            callback_timeout: cfg.callback_timeout(),
            exchange_timeout: cfg.exchange_timeout(),
        }
    }

    fn authenticator(&self, platform: Platform) -> Result<Arc<dyn Authenticator>, ClientError> {
        self.authenticators
            .get(&platform)
            .cloned()
            .ok_or_else(|| ClientError::auth(platform, "no authenticator configured"))
    }

    pub async fn state(&self, platform: Platform) -> AuthState {
        self.slots
            .lock()
            .await
            .get(&platform)
            .map(|s| s.state)
            .unwrap_or(AuthState::Unauthenticated)
    }

    async fn set_authenticated(&self, session: Session) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(session.platform).or_default();
        slot.state = AuthState::Authenticated;
        slot.session = Some(session);
        slot.pending = None;
    }

    async fn set_unauthenticated(&self, platform: Platform) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(platform).or_default();
        slot.state = AuthState::Unauthenticated;
        slot.session = None;
        slot.pending = None;
    }

    /// Rebuild a session from the stored credential. An expired record with a
    /// refresh token is refreshed silently; an expired record without one is
    /// treated as absent. Never prompts.
    pub async fn load_session(&self, platform: Platform) -> Result<Option<Session>, ClientError> {
        let record = self.store.blocking(move |s| s.load_credential(platform)).await?;
        let Some(record) = record else {
            debug!("{}: no stored credential", platform);
            self.drop_session_unless_pending(platform).await;
            return Ok(None);
        };

        if record.is_usable_at(Utc::now()) {
            let session = Session::from_record(&record);
            self.set_authenticated(session.clone()).await;
            return Ok(Some(session));
        }

        let Some(refresh_token) = record.secret.refresh_token().map(String::from) else {
            info!("{}: stored credential expired at {}", platform, record.expires_at);
            self.drop_session_unless_pending(platform).await;
            return Ok(None);
        };

        debug!("{}: stored credential expired, refreshing", platform);
        let refreshed = match self.authenticator(platform) {
            Ok(auth) => auth.refresh(&refresh_token).await,
            Err(e) => Err(e),
        };
        match refreshed {
            Ok(grant) => {
                let session = persist_grant(&self.store, platform, grant, Some(&record.secret)).await?;
                info!("{}: access token refreshed", platform);
                self.set_authenticated(session.clone()).await;
                Ok(Some(session))
            }
            Err(e) => {
                warn!("{}: token refresh failed: {}", platform, e);
                self.set_unauthenticated(platform).await;
                Err(ClientError::auth(platform, format!("token refresh failed: {}", e)))
            }
        }
    }

    async fn drop_session_unless_pending(&self, platform: Platform) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(platform).or_default();
        slot.session = None;
        if slot.state != AuthState::Pending {
            slot.state = AuthState::Unauthenticated;
        }
    }

    /// Guard run before every remote call: return the live session or reload
    /// it from the store. Fails with an authentication error when neither works.
    pub async fn ensure_session(&self, platform: Platform) -> Result<Session, ClientError> {
        {
            let slots = self.slots.lock().await;
            if let Some(slot) = slots.get(&platform) {
                if slot.state == AuthState::Authenticated {
                    if let Some(session) = slot.session.as_ref().filter(|s| s.is_live_at(Utc::now())) {
                        return Ok(session.clone());
                    }
                }
            }
        }
        self.load_session(platform)
            .await?
            .ok_or_else(|| ClientError::auth(platform, "not authenticated; run the auth command first"))
    }

    /// Start an interactive login. For redirect flows the caller shows the URL
    /// and then runs [`Self::await_redirect`]; device flows poll in the background.
    pub async fn begin_authentication(&self, platform: Platform) -> Result<AuthPrompt, ClientError> {
        let auth = self.authenticator(platform)?;
        let request = auth.begin().await?;
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(platform).or_default();
        if let Some(PendingAuth::Device(handle)) = slot.pending.take() {
            handle.abort();
        }
        slot.state = AuthState::Pending;
        let prompt = match request {
            AuthorizationRequest::Redirect {
                url,
                redirect_uri,
                state,
                code_verifier,
            } => {
                slot.pending = Some(PendingAuth::Redirect {
                    state,
                    code_verifier,
                    redirect_uri,
                });
                AuthPrompt::Browser { url }
            }
            AuthorizationRequest::Device(device) => {
                let prompt = AuthPrompt::Device {
                    verification_uri: device.verification_uri.clone(),
                    user_code: device.user_code.clone(),
                };
                let store = self.store.clone();
                let handle = tokio::spawn(async move {
                    let grant = poll_device_until_granted(auth.as_ref(), &device).await?;
                    persist_grant(&store, platform, grant, None).await
                });
                slot.pending = Some(PendingAuth::Device(handle));
                prompt
            }
        };
        info!("{}: authentication pending", platform);
        Ok(prompt)
    }

    /// Exchange an authorization code within the exchange timeout and persist
    /// the resulting credential.
    pub async fn complete_authentication(&self, platform: Platform, code: &str) -> Result<Session, ClientError> {
        let pending = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(platform).or_default();
            match slot.pending.take() {
                Some(PendingAuth::Redirect {
                    code_verifier,
                    redirect_uri,
                    ..
                }) => Some((code_verifier, redirect_uri)),
                other => {
                    slot.pending = other;
                    None
                }
            }
        };
        let Some((code_verifier, redirect_uri)) = pending else {
            return Err(ClientError::auth(platform, "no authorization-code login in progress"));
        };

        let auth = self.authenticator(platform)?;
        let exchanged = tokio::time::timeout(
            self.exchange_timeout,
            auth.exchange_code(code, &code_verifier, &redirect_uri),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ClientError::auth(
                platform,
                format!("token exchange did not finish within {}s", self.exchange_timeout.as_secs()),
            ))
        });

        let result = match exchanged {
            Ok(grant) => persist_grant(&self.store, platform, grant, None).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(session) => {
                info!("{}: authenticated", platform);
                self.set_authenticated(session.clone()).await;
                Ok(session)
            }
            Err(e) => {
                warn!("{}: authentication failed: {}", platform, e);
                self.set_unauthenticated(platform).await;
                Err(match e {
                    ClientError::Authentication { .. } => e,
                    other => ClientError::auth(platform, other.to_string()),
                })
            }
        }
    }

    async fn pending_redirect(&self, platform: Platform) -> Result<(String, String), ClientError> {
        let slots = self.slots.lock().await;
        match slots.get(&platform).and_then(|s| s.pending.as_ref()) {
            Some(PendingAuth::Redirect {
                state, redirect_uri, ..
            }) => Ok((state.clone(), redirect_uri.clone())),
            _ => Err(ClientError::auth(platform, "no authorization-code login in progress")),
        }
    }

    /// Bind the loopback listener for the pending redirect login.
    pub async fn listen_for_redirect(&self, platform: Platform) -> Result<CallbackListener, ClientError> {
        let (_, redirect_uri) = self.pending_redirect(platform).await?;
        let (addr, path) = redirect_target(platform, &redirect_uri)?;
        CallbackListener::bind(platform, addr, &path).await
    }

    /// Wait on `listener` for the redirect and return the authorization code.
    /// On timeout or a bad redirect the platform drops back to unauthenticated.
    pub async fn receive_code(&self, platform: Platform, listener: CallbackListener) -> Result<String, ClientError> {
        let (state, _) = self.pending_redirect(platform).await?;
        let received = listener.wait(&state, self.callback_timeout).await;
        if let Err(e) = &received {
            warn!("{}: {}", platform, e);
            self.set_unauthenticated(platform).await;
        }
        received
    }

    /// Listen for the redirect of a pending login and return its code.
    pub async fn await_redirect(&self, platform: Platform) -> Result<String, ClientError> {
        let listener = self.listen_for_redirect(platform).await?;
        self.receive_code(platform, listener).await
    }

    /// Non-blocking check on an in-flight login.
    pub async fn poll_status(&self, platform: Platform) -> PollStatus {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(platform).or_default();
        match slot.state {
            AuthState::Authenticated => return PollStatus::Success,
            AuthState::Unauthenticated | AuthState::Expired => return PollStatus::Failed,
            AuthState::Pending => {}
        }
        let finished = matches!(&slot.pending, Some(PendingAuth::Device(h)) if h.is_finished());
        if !finished {
            return PollStatus::Pending;
        }
        let Some(PendingAuth::Device(handle)) = slot.pending.take() else {
            return PollStatus::Pending;
        };
        match handle.await {
            Ok(Ok(session)) => {
                info!("{}: authenticated", platform);
                slot.state = AuthState::Authenticated;
                slot.session = Some(session);
                PollStatus::Success
            }
            Ok(Err(e)) => {
                warn!("{}: authentication failed: {}", platform, e);
                slot.state = AuthState::Unauthenticated;
                PollStatus::Failed
            }
            Err(e) => {
                warn!("{}: device polling task ended abnormally: {}", platform, e);
                slot.state = AuthState::Unauthenticated;
                PollStatus::Failed
            }
        }
    }

    /// Run a full login. `on_prompt` is called once the user can act: after the
    /// loopback listener is bound, or as soon as the device code is known.
    pub async fn authenticate_interactive<F>(&self, platform: Platform, on_prompt: F) -> Result<Session, ClientError>
    where
        F: FnOnce(&AuthPrompt),
    {
        let prompt = self.begin_authentication(platform).await?;
        match &prompt {
            AuthPrompt::Browser { .. } => {
                let listener = match self.listen_for_redirect(platform).await {
                    Ok(l) => l,
                    Err(e) => {
                        self.set_unauthenticated(platform).await;
                        return Err(e);
                    }
                };
                on_prompt(&prompt);
                let code = self.receive_code(platform, listener).await?;
                self.complete_authentication(platform, &code).await
            }
            AuthPrompt::Device { .. } => {
                on_prompt(&prompt);
                loop {
                    match self.poll_status(platform).await {
                        PollStatus::Pending => tokio::time::sleep(Duration::from_millis(500)).await,
                        PollStatus::Success => return self.ensure_session(platform).await,
                        PollStatus::Failed => {
                            return Err(ClientError::auth(platform, "device authorization failed or expired"))
                        }
                    }
                }
            }
        }
    }

    /// A remote call rejected the credential; the next guard reloads it.
    pub async fn mark_expired(&self, platform: Platform) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&platform) {
            if slot.state == AuthState::Authenticated {
                debug!("{}: session marked expired", platform);
                slot.state = AuthState::Expired;
                slot.session = None;
            }
        }
    }

    /// Forget the platform: in-memory session, stored credential and every
    /// cached playlist row. Returns the number of cached playlists purged.
    pub async fn disconnect(&self, platform: Platform) -> Result<usize, ClientError> {
        {
            let mut slots = self.slots.lock().await;
            if let Some(PendingAuth::Device(handle)) = slots.get_mut(&platform).and_then(|s| s.pending.take()) {
                handle.abort();
            }
        }
        self.set_unauthenticated(platform).await;
        let purged = self
            .store
            .blocking(move |s| {
                s.delete_credential(platform)?;
                s.purge_platform(platform)
            })
            .await?;
        info!("{}: disconnected, {} cached playlists purged", platform, purged);
        Ok(purged)
    }
}

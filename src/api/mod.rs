pub mod mock;
pub mod pkce;
pub mod spotify;
pub mod spotify_auth;
pub mod tidal;
pub mod tidal_auth;

use crate::auth::{Session, SessionManager};
use crate::error::{ClientError, ModificationFailure};
use crate::models::{Platform, Playlist, Track};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wire-level access to one catalog. Every call takes the session it should run
/// under; implementations keep no authentication state of their own.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> Platform;

    /// All playlists of the current user, every page drained.
    async fn list_playlists(&self, session: &Session) -> Result<Vec<Playlist>, ClientError>;

    /// All tracks of a playlist. Entries without a resolvable track are skipped.
    async fn list_tracks(&self, session: &Session, playlist_id: &str) -> Result<Vec<Track>, ClientError>;

    /// Always creates a new playlist and returns its id.
    async fn create_playlist(&self, session: &Session, name: &str) -> Result<String, ClientError>;

    async fn add_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError>;

    async fn remove_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError>;

    /// Best remote-ranked hit for a free-text query.
    async fn search_track(&self, session: &Session, query: &str) -> Result<Option<Track>, ClientError>;
}

/// Token material returned by an authorization server.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}
fn default_expires_in() -> i64 {
    3600
}

/// Pending device-code authorization.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: Duration,
    pub expires_in: Duration,
}

/// First leg of an interactive login.
#[derive(Debug, Clone)]
pub enum AuthorizationRequest {
    /// Authorization-code flow: the user opens `url`, the platform redirects
    /// to `redirect_uri` with `code` and `state`.
    Redirect {
        url: String,
        redirect_uri: String,
        state: String,
        code_verifier: String,
    },
    /// Device-code flow: the user visits `verification_uri` while we poll.
    Device(DeviceAuthorization),
}

/// One poll of a device-code token endpoint.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Granted(TokenGrant),
}

/// OAuth conversations with one platform's authorization server.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn platform(&self) -> Platform;

    async fn begin(&self) -> Result<AuthorizationRequest, ClientError>;

    async fn exchange_code(&self, code: &str, code_verifier: &str, redirect_uri: &str) -> Result<TokenGrant, ClientError> {
        let _ = (code, code_verifier, redirect_uri);
        Err(ClientError::auth(self.platform(), "authorization-code exchange is not supported"))
    }

    async fn poll_device(&self, device: &DeviceAuthorization) -> Result<DevicePoll, ClientError> {
        let _ = device;
        Err(ClientError::auth(self.platform(), "device-code polling is not supported"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ClientError>;
}

/// Whether a failed request was a read or a playlist mutation; decides how
/// 404 and 429 are classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallKind {
    Read,
    Mutation,
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) async fn status_error(platform: Platform, kind: CallKind, what: &str, resp: Response) -> ClientError {
    let status = resp.status();
    let wait = retry_after(&resp);
    let body = resp.text().await.unwrap_or_default();
    let reason = format!("{} failed: {} => {}", what, status, body);
    match (status, kind) {
        (StatusCode::UNAUTHORIZED, _) | (StatusCode::FORBIDDEN, _) => ClientError::auth(platform, reason),
        (StatusCode::TOO_MANY_REQUESTS, CallKind::Mutation) => {
            ClientError::modification(platform, ModificationFailure::RateLimited { retry_after: wait }, reason)
        }
        (StatusCode::TOO_MANY_REQUESTS, CallKind::Read) => ClientError::Transient {
            platform,
            reason,
            retry_after: wait,
        },
        (StatusCode::NOT_FOUND, CallKind::Mutation) => {
            ClientError::modification(platform, ModificationFailure::NotFound, reason)
        }
        (StatusCode::BAD_REQUEST, CallKind::Mutation) | (StatusCode::UNPROCESSABLE_ENTITY, CallKind::Mutation) => {
            ClientError::modification(platform, ModificationFailure::Malformed, reason)
        }
        (s, _) if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => ClientError::transient(platform, reason),
        (_, CallKind::Mutation) => ClientError::modification(platform, ModificationFailure::Rejected, reason),
        (_, CallKind::Read) => ClientError::decode(platform, reason),
    }
}

/// A platform client bound to the session manager and retry policy.
///
/// Each call first runs the `ensure_session` guard, then the remote call under
/// the retry policy. A rejected credential marks the session expired so the
/// next guard reloads or refreshes it.
#[derive(Clone)]
pub struct SessionClient {
    client: Arc<dyn PlatformClient>,
    sessions: Arc<SessionManager>,
    retry: RetryPolicy,
}

impl SessionClient {
    pub fn new(client: Arc<dyn PlatformClient>, sessions: Arc<SessionManager>, retry: RetryPolicy) -> Self {
        Self { client, sessions, retry }
    }

    pub fn platform(&self) -> Platform {
        self.client.platform()
    }

    async fn call<T, F, Fut>(&self, name: &str, f: F) -> Result<T, ClientError>
    where
        F: Fn(Arc<dyn PlatformClient>, Session) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let platform = self.platform();
        let session = self.sessions.ensure_session(platform).await?;
        let op_name = format!("{} {}", platform, name);
        let result = self
            .retry
            .run(&op_name, || f(self.client.clone(), session.clone()))
            .await;
        if let Err(e) = &result {
            if e.is_authentication() {
                self.sessions.mark_expired(platform).await;
            }
        }
        result
    }

    pub async fn list_playlists(&self) -> Result<Vec<Playlist>, ClientError> {
        self.call("list_playlists", |client, session| async move {
            client.list_playlists(&session).await
        })
        .await
    }

    pub async fn list_tracks(&self, playlist_id: &str) -> Result<Vec<Track>, ClientError> {
        self.call("list_tracks", |client, session| {
            let playlist_id = playlist_id.to_string();
            async move { client.list_tracks(&session, &playlist_id).await }
        })
        .await
    }

    /// First exact (case-sensitive) name match. `None` is not an error.
    pub async fn find_playlist_by_name(&self, name: &str) -> Result<Option<Playlist>, ClientError> {
        let playlists = self.list_playlists().await?;
        Ok(playlists.into_iter().find(|p| p.name == name))
    }

    pub async fn create_playlist(&self, name: &str) -> Result<String, ClientError> {
        self.call("create_playlist", |client, session| {
            let name = name.to_string();
            async move { client.create_playlist(&session, &name).await }
        })
        .await
    }

    pub async fn add_tracks(&self, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        self.call("add_tracks", |client, session| {
            let playlist_id = playlist_id.to_string();
            let ids = track_ids.to_vec();
            async move { client.add_tracks(&session, &playlist_id, &ids).await }
        })
        .await
    }

    pub async fn remove_tracks(&self, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        self.call("remove_tracks", |client, session| {
            let playlist_id = playlist_id.to_string();
            let ids = track_ids.to_vec();
            async move { client.remove_tracks(&session, &playlist_id, &ids).await }
        })
        .await
    }

    /// Search is advisory: failures are logged and reported as no match.
    pub async fn search_track(&self, query: &str) -> Option<Track> {
        let res = self
            .call("search_track", |client, session| {
                let query = query.to_string();
                async move { client.search_track(&session, &query).await }
            })
            .await;
        match res {
            Ok(Some(t)) => Some(t),
            Ok(None) => {
                debug!("{}: no search results for {:?}", self.platform(), query);
                None
            }
            Err(e) => {
                warn!("{}: search for {:?} failed: {}", self.platform(), query, e);
                None
            }
        }
    }
}

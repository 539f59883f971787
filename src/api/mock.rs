use super::{AuthorizationRequest, Authenticator, DeviceAuthorization, DevicePoll, PlatformClient, TokenGrant};
use crate::auth::Session;
use crate::error::{ClientError, ModificationFailure};
use crate::models::{Platform, Playlist, Track};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// A remote call as recorded by [`MockCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListPlaylists,
    ListTracks(String),
    Create(String),
    Add(String, Vec<String>),
    Remove(String, Vec<String>),
    Search(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Call::Create(_) | Call::Add(..) | Call::Remove(..))
    }
}

struct MockPlaylist {
    id: String,
    name: String,
    tracks: Vec<Track>,
}

#[derive(Default)]
struct CatalogState {
    playlists: Vec<MockPlaylist>,
    searchable: Vec<Track>,
    calls: Vec<Call>,
    reject_auth: bool,
    auth_after: Option<u32>,
    transient_failures: u32,
    failing_adds: HashMap<String, ModificationFailure>,
    next_id: u32,
}

/// In-memory catalog used in tests. Records every call and can be told to
/// fail in the ways a real platform does.
pub struct MockCatalog {
    platform: Platform,
    state: Mutex<CatalogState>,
}

pub fn track(id: &str, title: &str, artist: &str) -> Track {
    Track {
        id: id.to_string(),
        title: title.to_string(),
        artists: vec![artist.to_string()],
        album: String::new(),
        platform_uri: format!("mock:track:{}", id),
    }
}

impl MockCatalog {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Mutex::new(CatalogState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a playlist and return its id.
    pub fn add_playlist(&self, name: &str, tracks: Vec<Track>) -> String {
        let mut st = self.lock();
        st.next_id += 1;
        let id = format!("{}-pl-{}", self.platform, st.next_id);
        for t in &tracks {
            if !st.searchable.iter().any(|s| s.id == t.id) {
                st.searchable.push(t.clone());
            }
        }
        st.playlists.push(MockPlaylist {
            id: id.clone(),
            name: name.to_string(),
            tracks,
        });
        id
    }

    /// Make a track findable by search without putting it in any playlist.
    pub fn add_searchable(&self, track: Track) {
        self.lock().searchable.push(track);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.lock().reject_auth = reject;
    }

    /// Accept the next `n` calls, then reject the credential on every call after.
    pub fn reject_auth_after(&self, n: u32) {
        self.lock().auth_after = Some(n);
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Adding `track_id` to any playlist fails with `kind`.
    pub fn fail_add_of(&self, track_id: &str, kind: ModificationFailure) {
        self.lock().failing_adds.insert(track_id.to_string(), kind);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn track_ids(&self, playlist_id: &str) -> Vec<String> {
        self.lock()
            .playlists
            .iter()
            .find(|p| p.id == playlist_id)
            .map(|p| p.tracks.iter().map(|t| t.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn playlist_named(&self, name: &str) -> Option<String> {
        self.lock().playlists.iter().find(|p| p.name == name).map(|p| p.id.clone())
    }

    pub fn playlist_count(&self) -> usize {
        self.lock().playlists.len()
    }

    /// Record `call` and apply injected failures.
    fn enter(&self, call: Call) -> Result<std::sync::MutexGuard<'_, CatalogState>, ClientError> {
        let mut st = self.lock();
        st.calls.push(call);
        match st.auth_after {
            Some(0) => st.reject_auth = true,
            Some(n) => st.auth_after = Some(n - 1),
            None => {}
        }
        if st.reject_auth {
            return Err(ClientError::auth(self.platform, "401 token rejected"));
        }
        if st.transient_failures > 0 {
            st.transient_failures -= 1;
            return Err(ClientError::transient(self.platform, "503 service unavailable"));
        }
        Ok(st)
    }

    fn not_found(&self, playlist_id: &str) -> ClientError {
        ClientError::modification(self.platform, ModificationFailure::NotFound, format!("no playlist {}", playlist_id))
    }
}

#[async_trait]
impl PlatformClient for MockCatalog {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn list_playlists(&self, _session: &Session) -> Result<Vec<Playlist>, ClientError> {
        let st = self.enter(Call::ListPlaylists)?;
        Ok(st
            .playlists
            .iter()
            .map(|p| Playlist {
                id: p.id.clone(),
                name: p.name.clone(),
                track_count: p.tracks.len() as u32,
            })
            .collect())
    }

    async fn list_tracks(&self, _session: &Session, playlist_id: &str) -> Result<Vec<Track>, ClientError> {
        let st = self.enter(Call::ListTracks(playlist_id.to_string()))?;
        st.playlists
            .iter()
            .find(|p| p.id == playlist_id)
            .map(|p| p.tracks.clone())
            .ok_or_else(|| ClientError::decode(self.platform, format!("404 no playlist {}", playlist_id)))
    }

    async fn create_playlist(&self, _session: &Session, name: &str) -> Result<String, ClientError> {
        drop(self.enter(Call::Create(name.to_string()))?);
        info!("{} mock: create playlist {}", self.platform, name);
        Ok(self.add_playlist(name, Vec::new()))
    }

    async fn add_tracks(&self, _session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let mut st = self.enter(Call::Add(playlist_id.to_string(), track_ids.to_vec()))?;
        if let Some(kind) = track_ids.iter().find_map(|id| st.failing_adds.get(id).cloned()) {
            return Err(ClientError::modification(self.platform, kind, "injected add failure"));
        }
        let resolved: Vec<Track> = track_ids
            .iter()
            .map(|id| {
                st.searchable
                    .iter()
                    .find(|t| &t.id == id)
                    .cloned()
                    .unwrap_or_else(|| track(id, id, ""))
            })
            .collect();
        let pl = st
            .playlists
            .iter_mut()
            .find(|p| p.id == playlist_id)
            .ok_or_else(|| self.not_found(playlist_id))?;
        pl.tracks.extend(resolved);
        Ok(())
    }

    async fn remove_tracks(&self, _session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let mut st = self.enter(Call::Remove(playlist_id.to_string(), track_ids.to_vec()))?;
        let pl = st
            .playlists
            .iter_mut()
            .find(|p| p.id == playlist_id)
            .ok_or_else(|| self.not_found(playlist_id))?;
        pl.tracks.retain(|t| !track_ids.contains(&t.id));
        Ok(())
    }

    async fn search_track(&self, _session: &Session, query: &str) -> Result<Option<Track>, ClientError> {
        let st = self.enter(Call::Search(query.to_string()))?;
        let q = query.to_lowercase();
        Ok(st
            .searchable
            .iter()
            .find(|t| q.contains(&t.title.to_lowercase()) && t.artists.iter().all(|a| q.contains(&a.to_lowercase())))
            .cloned())
    }
}

/// Scripted authorization server for session lifecycle tests.
pub struct MockAuthenticator {
    platform: Platform,
    device: bool,
    refresh_ok: bool,
    pending_polls: AtomicU32,
    refreshes: AtomicU32,
    exchanges: AtomicU32,
}

impl MockAuthenticator {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            device: false,
            refresh_ok: true,
            pending_polls: AtomicU32::new(0),
            refreshes: AtomicU32::new(0),
            exchanges: AtomicU32::new(0),
        }
    }

    /// Use the device flow; the first `pending` polls report pending.
    pub fn device_flow(mut self, pending: u32) -> Self {
        self.device = true;
        self.pending_polls = AtomicU32::new(pending);
        self
    }

    pub fn failing_refresh(mut self) -> Self {
        self.refresh_ok = false;
        self
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn exchange_count(&self) -> u32 {
        self.exchanges.load(Ordering::SeqCst)
    }

    fn grant(&self, access_token: &str) -> TokenGrant {
        TokenGrant {
            access_token: access_token.to_string(),
            token_type: "Bearer".into(),
            refresh_token: Some("refresh-1".into()),
            scope: None,
            expires_in: 3600,
            user_id: Some("user-1".into()),
        }
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn begin(&self) -> Result<AuthorizationRequest, ClientError> {
        if self.device {
            return Ok(AuthorizationRequest::Device(DeviceAuthorization {
                device_code: "dev-1".into(),
                user_code: "ABCD-EFGH".into(),
                verification_uri: "https://link.example/ABCD-EFGH".into(),
                interval: Duration::from_millis(10),
                expires_in: Duration::from_secs(5),
            }));
        }
        Ok(AuthorizationRequest::Redirect {
            url: "https://auth.example/authorize?state=st-1".into(),
            redirect_uri: "http://127.0.0.1:0/callback".into(),
            state: "st-1".into(),
            code_verifier: "verifier".into(),
        })
    }

    async fn exchange_code(&self, code: &str, _code_verifier: &str, _redirect_uri: &str) -> Result<TokenGrant, ClientError> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        if code == "bad-code" {
            return Err(ClientError::auth(self.platform, "invalid_grant"));
        }
        Ok(self.grant("exchanged-token"))
    }

    async fn poll_device(&self, _device: &DeviceAuthorization) -> Result<DevicePoll, ClientError> {
        let left = self.pending_polls.load(Ordering::SeqCst);
        if left > 0 {
            self.pending_polls.store(left - 1, Ordering::SeqCst);
            return Ok(DevicePoll::Pending);
        }
        Ok(DevicePoll::Granted(self.grant("device-token")))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, ClientError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_ok {
            Ok(self.grant("refreshed-token"))
        } else {
            Err(ClientError::auth(self.platform, "invalid_grant"))
        }
    }
}

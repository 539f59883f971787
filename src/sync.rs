use crate::api::spotify::SpotifyClient;
use crate::api::spotify_auth::SpotifyAuthenticator;
use crate::api::tidal::TidalClient;
use crate::api::tidal_auth::TidalAuthenticator;
use crate::api::{Authenticator, PlatformClient, SessionClient};
use crate::auth::SessionManager;
use crate::config::Config;
use crate::db::Store;
use crate::error::ClientError;
use crate::models::{Platform, Playlist, PlaylistCacheEntry, SyncOutcome, SyncSummary};
use crate::reconcile::ReconcileEngine;
use crate::retry::RetryPolicy;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives reconciliation across many playlists, one at a time.
///
/// Cancellation is honoured between playlists only, never in the middle of
/// one, so a playlist is never left half reconciled by an interrupt.
pub struct SyncManager {
    engine: ReconcileEngine,
    sessions: Arc<SessionManager>,
    store: Store,
    cancel: CancellationToken,
}

fn label(playlist: &Playlist, source: Platform) -> String {
    format!("{} ({} -> {})", playlist.name, source, source.complement())
}

impl SyncManager {
    /// Wire the real Spotify and TIDAL clients from configuration.
    pub fn new(cfg: &Config) -> Result<Self, ClientError> {
        let store = Store::open(&cfg.db_path)?;
        let authenticators: Vec<Arc<dyn Authenticator>> = vec![
            Arc::new(SpotifyAuthenticator::new(&cfg.spotify)),
            Arc::new(TidalAuthenticator::new(&cfg.tidal)),
        ];
        let sessions = Arc::new(SessionManager::new(store.clone(), authenticators, &cfg.auth));
        let spotify = Arc::new(SpotifyClient::new(&cfg.spotify.api_base, &cfg.playlist_description));
        let tidal = Arc::new(TidalClient::new(
            &cfg.tidal.api_base,
            &cfg.tidal.country_code,
            &cfg.playlist_description,
        ));
        Ok(Self::with_clients(store, sessions, spotify, tidal, RetryPolicy::from(&cfg.retry)))
    }

    pub fn with_clients(
        store: Store,
        sessions: Arc<SessionManager>,
        spotify: Arc<dyn PlatformClient>,
        tidal: Arc<dyn PlatformClient>,
        retry: RetryPolicy,
    ) -> Self {
        let spotify = SessionClient::new(spotify, sessions.clone(), retry.clone());
        let tidal = SessionClient::new(tidal, sessions.clone(), retry);
        Self {
            engine: ReconcileEngine::new(spotify, tidal, store.clone()),
            sessions,
            store,
            cancel: CancellationToken::new(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    /// Token that stops a running batch before its next playlist.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cached playlist metadata, no network.
    pub async fn list_cached(&self, platform: Platform) -> Result<Vec<PlaylistCacheEntry>, ClientError> {
        Ok(self.store.blocking(move |s| s.cached_playlists(platform)).await?)
    }

    /// List playlists remotely and update the cache.
    pub async fn refresh(&self, platform: Platform) -> Result<Vec<Playlist>, ClientError> {
        let playlists = self.engine.client(platform).list_playlists().await?;
        let cached = playlists.clone();
        self.store
            .blocking(move |s| s.upsert_playlists(platform, &cached))
            .await?;
        info!("{}: cached {} playlists", platform, playlists.len());
        Ok(playlists)
    }

    /// Remote listing, or the cached one when the platform rejects our credential.
    pub async fn playlists_or_cached(&self, platform: Platform) -> Result<Vec<Playlist>, ClientError> {
        match self.refresh(platform).await {
            Ok(p) => Ok(p),
            Err(e) if e.is_authentication() => {
                warn!("{}: {}; using cached playlists", platform, e);
                Ok(self
                    .list_cached(platform)
                    .await?
                    .into_iter()
                    .map(|c| Playlist {
                        id: c.playlist_id,
                        name: c.name,
                        track_count: c.track_count,
                    })
                    .collect())
            }
            Err(e) => Err(e),
        }
    }

    /// Names present on both platforms, sorted.
    pub async fn common_playlists(&self) -> Result<Vec<String>, ClientError> {
        let spotify: HashSet<String> = self
            .playlists_or_cached(Platform::Spotify)
            .await?
            .into_iter()
            .map(|p| p.name)
            .collect();
        let tidal = self.playlists_or_cached(Platform::Tidal).await?;
        let common: BTreeSet<String> = tidal.into_iter().map(|p| p.name).filter(|n| spotify.contains(n)).collect();
        Ok(common.into_iter().collect())
    }

    async fn run_batch(&self, work: Vec<(Platform, Playlist)>, mut summary: SyncSummary) -> SyncSummary {
        let mut work = work.into_iter();
        while let Some((source, playlist)) = work.next() {
            if self.cancel.is_cancelled() {
                warn!("Sync cancelled; {} playlists not started", work.len() + 1);
                summary.skipped.push(label(&playlist, source));
                summary.skipped.extend(work.map(|(s, p)| label(&p, s)));
                break;
            }
            match self.engine.reconcile(&playlist, source).await {
                Ok(_) => summary.succeeded.push(label(&playlist, source)),
                Err(e) => {
                    error!("{}", e);
                    let stop = e.is_authentication();
                    summary.failed.push((label(&playlist, source), e.to_string()));
                    if stop {
                        warn!("Stopping batch after authentication failure; {} playlists not started", work.len());
                        summary.skipped.extend(work.map(|(s, p)| label(&p, s)));
                        break;
                    }
                }
            }
        }
        summary
    }

    /// Reconcile every playlist of both platforms once, each from the
    /// platform it was listed on.
    pub async fn sync_all(&self) -> Result<SyncSummary, ClientError> {
        let mut seen = HashSet::new();
        let mut work = Vec::new();
        for platform in Platform::ALL {
            for playlist in self.refresh(platform).await? {
                if seen.insert((platform, playlist.id.clone())) {
                    work.push((platform, playlist));
                }
            }
        }
        info!("Syncing {} playlists", work.len());
        let summary = self.run_batch(work, SyncSummary::default()).await;
        info!("Sync finished: {}", summary.to_string().lines().next().unwrap_or_default());
        Ok(summary)
    }

    /// Reconcile the named playlists. A name is looked up on Spotify first,
    /// then TIDAL; the platform it is found on is the source. Unknown names
    /// are skipped.
    pub async fn sync_by_names(&self, names: &[String]) -> Result<SyncSummary, ClientError> {
        let spotify = self.refresh(Platform::Spotify).await?;
        let tidal = self.refresh(Platform::Tidal).await?;
        let mut summary = SyncSummary::default();
        let mut work = Vec::new();
        for name in names {
            let found = spotify
                .iter()
                .find(|p| &p.name == name)
                .map(|p| (Platform::Spotify, p.clone()))
                .or_else(|| tidal.iter().find(|p| &p.name == name).map(|p| (Platform::Tidal, p.clone())));
            match found {
                Some(pair) => work.push(pair),
                None => {
                    warn!("Playlist '{}' not found on either platform; skipping", name);
                    summary.skipped.push(name.clone());
                }
            }
        }
        Ok(self.run_batch(work, summary).await)
    }

    /// Reconcile one identified playlist and report the outcome instead of failing.
    pub async fn sync_pair(&self, source: Platform, target: Platform, playlist_id: &str) -> SyncOutcome {
        if target != source.complement() {
            return SyncOutcome::Error {
                message: format!("Cannot sync {} to itself", source),
            };
        }
        let playlists = match self.refresh(source).await {
            Ok(p) => p,
            Err(e) => {
                error!("Listing {} playlists failed: {}", source, e);
                return SyncOutcome::Error { message: e.to_string() };
            }
        };
        let Some(playlist) = playlists.into_iter().find(|p| p.id == playlist_id) else {
            return SyncOutcome::Error {
                message: "Playlist not found".to_string(),
            };
        };
        match self.engine.reconcile(&playlist, source).await {
            Ok(_) => SyncOutcome::Success {
                message: format!("Successfully synced playlist '{}' from {} to {}", playlist.name, source, target),
            },
            Err(e) => {
                error!("{}", e);
                SyncOutcome::Error { message: e.to_string() }
            }
        }
    }
}

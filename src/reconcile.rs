use crate::api::SessionClient;
use crate::db::Store;
use crate::error::{ClientError, SyncError};
use crate::matcher::TrackMatcher;
use crate::models::{Platform, Playlist, Track};
use chrono::Utc;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Mutations needed to bring a target playlist in line with its matched source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Target-platform ids to add, in source order.
    pub to_add: Vec<String>,
    /// Target-platform ids no matched source track reaches, in target order.
    pub to_remove: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Diff over target-platform ids. `matched` holds the target id of every
/// source track that found a counterpart; `target` is the current target playlist.
pub fn plan(matched: &[String], target: &[String]) -> Plan {
    let present: HashSet<&str> = target.iter().map(String::as_str).collect();
    let wanted: HashSet<&str> = matched.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let to_add = matched
        .iter()
        .filter(|id| !present.contains(id.as_str()))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    let mut seen = HashSet::new();
    let to_remove = target
        .iter()
        .filter(|id| !wanted.contains(id.as_str()))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();

    Plan { to_add, to_remove }
}

/// What one reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub target_playlist_id: String,
    pub created: bool,
    pub added: usize,
    pub removed: usize,
    pub unmatched: usize,
    /// Single add/remove calls that failed and were skipped.
    pub failed: usize,
}

/// Track lists read during one reconciliation, kept for the cache update.
struct Fetched {
    source_tracks: Vec<Track>,
    target_tracks: Vec<Track>,
    matched_tracks: Vec<Track>,
}

/// One-way playlist reconciliation between the two platforms.
#[derive(Clone)]
pub struct ReconcileEngine {
    spotify: SessionClient,
    tidal: SessionClient,
    matcher: TrackMatcher,
    store: Store,
}

impl ReconcileEngine {
    pub fn new(spotify: SessionClient, tidal: SessionClient, store: Store) -> Self {
        Self {
            spotify,
            tidal,
            matcher: TrackMatcher::new(store.clone()),
            store,
        }
    }

    pub fn client(&self, platform: Platform) -> &SessionClient {
        match platform {
            Platform::Spotify => &self.spotify,
            Platform::Tidal => &self.tidal,
        }
    }

    /// Make the playlist named `playlist.name` on the other platform contain
    /// the matched counterparts of `playlist`'s tracks, and nothing else.
    ///
    /// Running it twice without upstream changes issues no mutations the
    /// second time. Unmatched tracks and single failed mutations are logged
    /// and skipped; listing, creation and credential failures abort this
    /// playlist with a [`SyncError`].
    pub async fn reconcile(&self, playlist: &Playlist, source: Platform) -> Result<ReconcileReport, SyncError> {
        let target = source.complement();
        let src = self.client(source);
        let dst = self.client(target);
        let fail = |e: ClientError| SyncError::new(&playlist.name, e);

        info!("Syncing playlist '{}' from {} to {}", playlist.name, source, target);
        let source_tracks = src.list_tracks(&playlist.id).await.map_err(fail)?;

        let mut report = ReconcileReport::default();
        let target_id = match dst.find_playlist_by_name(&playlist.name).await.map_err(fail)? {
            Some(existing) => existing.id,
            None => {
                info!("Creating playlist '{}' on {}", playlist.name, target);
                report.created = true;
                dst.create_playlist(&playlist.name).await.map_err(fail)?
            }
        };
        report.target_playlist_id = target_id.clone();

        let target_tracks = dst.list_tracks(&target_id).await.map_err(fail)?;

        let mut matched: Vec<String> = Vec::with_capacity(source_tracks.len());
        let mut matched_tracks: Vec<Track> = Vec::new();
        for track in &source_tracks {
            match self.matcher.find_match(track, source, dst).await {
                Some(hit) => {
                    matched.push(hit.id.clone());
                    matched_tracks.push(hit);
                }
                None => report.unmatched += 1,
            }
        }

        let target_ids: Vec<String> = target_tracks.iter().map(|t| t.id.clone()).collect();
        let plan = plan(&matched, &target_ids);
        debug!(
            "'{}': {} to add, {} to remove, {} unmatched",
            playlist.name,
            plan.to_add.len(),
            plan.to_remove.len(),
            report.unmatched
        );

        for id in &plan.to_add {
            match dst.add_tracks(&target_id, std::slice::from_ref(id)).await {
                Ok(()) => {
                    report.added += 1;
                    debug!("Added {} to '{}' on {}", id, playlist.name, target);
                }
                Err(e) if e.is_authentication() => return Err(fail(e)),
                Err(e) => {
                    report.failed += 1;
                    warn!("Could not add {} to '{}' on {}: {}", id, playlist.name, target, e);
                }
            }
        }
        for id in &plan.to_remove {
            match dst.remove_tracks(&target_id, std::slice::from_ref(id)).await {
                Ok(()) => {
                    report.removed += 1;
                    debug!("Removed {} from '{}' on {}", id, playlist.name, target);
                }
                Err(e) if e.is_authentication() => return Err(fail(e)),
                Err(e) => {
                    report.failed += 1;
                    warn!("Could not remove {} from '{}' on {}: {}", id, playlist.name, target, e);
                }
            }
        }

        let fetched = Fetched {
            source_tracks,
            target_tracks,
            matched_tracks,
        };
        self.refresh_cache(playlist, source, fetched, &report).await;
        info!(
            "Synced '{}' to {}: {} added, {} removed, {} unmatched",
            playlist.name, target, report.added, report.removed, report.unmatched
        );
        Ok(report)
    }

    async fn refresh_cache(&self, playlist: &Playlist, source: Platform, fetched: Fetched, report: &ReconcileReport) {
        let target = source.complement();
        let now = Utc::now();
        let source_entry = Playlist {
            track_count: fetched.source_tracks.len() as u32,
            ..playlist.clone()
        };
        let target_count = (fetched.target_tracks.len() + report.added).saturating_sub(report.removed);
        let target_entry = Playlist {
            id: report.target_playlist_id.clone(),
            name: playlist.name.clone(),
            track_count: target_count as u32,
        };
        let Fetched {
            source_tracks,
            mut target_tracks,
            matched_tracks,
        } = fetched;
        target_tracks.extend(matched_tracks);

        let updated = self
            .store
            .blocking(move |s| {
                s.mark_synced(source, &source_entry, now)?;
                s.mark_synced(target, &target_entry, now)?;
                s.cache_tracks(source, &source_tracks)?;
                s.cache_tracks(target, &target_tracks)
            })
            .await;
        if let Err(e) = updated {
            warn!("Could not update playlist cache for '{}': {}", playlist.name, e);
        }
    }
}

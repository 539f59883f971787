use crate::api::SessionClient;
use crate::db::Store;
use crate::models::{Platform, Track};
use tracing::{debug, warn};

/// Free-text query used to look a track up on the other platform:
/// the title followed by every artist, space separated.
pub fn search_query(track: &Track) -> String {
    let mut q = track.title.trim().to_string();
    for artist in &track.artists {
        let artist = artist.trim();
        if !artist.is_empty() {
            q.push(' ');
            q.push_str(artist);
        }
    }
    q.trim().to_string()
}

/// Heuristic cross-platform track lookup.
///
/// The top search hit is taken as the match; there is no album, duration or
/// ISRC cross-check. Resolved pairs are remembered in the store so a track is
/// searched for at most once per target platform.
#[derive(Clone)]
pub struct TrackMatcher {
    store: Store,
}

impl TrackMatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn remembered(&self, source: Platform, source_id: &str, target: Platform) -> Option<Track> {
        let source_id = source_id.to_string();
        let found = self
            .store
            .blocking(move |s| {
                let Some(target_id) = s.lookup_match(source, &source_id, target)? else {
                    return Ok(None);
                };
                let cached = s.cached_track(target, &target_id)?;
                Ok(Some(cached.unwrap_or(Track {
                    platform_uri: String::new(),
                    title: String::new(),
                    artists: Vec::new(),
                    album: String::new(),
                    id: target_id,
                })))
            })
            .await;
        match found {
            Ok(hit) => hit,
            Err(e) => {
                debug!("match cache unavailable: {}", e);
                None
            }
        }
    }

    async fn remember(&self, source: Platform, source_id: &str, hit: &Track, target: Platform) {
        let source_id = source_id.to_string();
        let hit = hit.clone();
        let saved = self
            .store
            .blocking(move |s| {
                s.save_match(source, &source_id, target, &hit.id)?;
                s.cache_tracks(target, std::slice::from_ref(&hit))
            })
            .await;
        if let Err(e) = saved {
            debug!("could not remember match: {}", e);
        }
    }

    /// Find `track` (from `source`) on the platform behind `target`.
    /// An absent match logs one warning and returns `None`.
    pub async fn find_match(&self, track: &Track, source: Platform, target: &SessionClient) -> Option<Track> {
        let target_platform = target.platform();
        if let Some(hit) = self.remembered(source, &track.id, target_platform).await {
            debug!("{}: remembered match {} -> {}", target_platform, track.id, hit.id);
            return Some(hit);
        }

        let query = search_query(track);
        if query.is_empty() {
            warn!("No match on {} for track {}: nothing to search for", target_platform, track.id);
            return None;
        }
        match target.search_track(&query).await {
            Some(hit) => {
                debug!("{}: matched {:?} to {}", target_platform, query, hit.id);
                self.remember(source, &track.id, &hit, target_platform).await;
                Some(hit)
            }
            None => {
                warn!("No match on {} for {}", target_platform, track.display_name());
                None
            }
        }
    }
}

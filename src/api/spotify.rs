use super::{status_error, CallKind, PlatformClient};
use crate::auth::Session;
use crate::error::ClientError;
use crate::models::{Platform, Playlist, Track};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

/// Maximum number of track URIs Spotify accepts per add/remove call.
const MUTATION_CHUNK: usize = 100;

/// Spotify Web API adapter.
pub struct SpotifyClient {
    http: Client,
    api_base: String,
    description: String,
}

fn track_uri(id: &str) -> String {
    if id.starts_with("spotify:") {
        id.to_string()
    } else {
        format!("spotify:track:{}", id)
    }
}

/// Parse a Spotify track object. Local files and unavailable entries have a
/// null id and are dropped.
fn parse_track(t: &Value) -> Option<Track> {
    let id = t["id"].as_str()?.to_string();
    let artists = t["artists"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|x| x["name"].as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();
    Some(Track {
        title: t["name"].as_str().unwrap_or_default().to_string(),
        artists,
        album: t["album"]["name"].as_str().unwrap_or_default().to_string(),
        platform_uri: t["uri"].as_str().map(String::from).unwrap_or_else(|| track_uri(&id)),
        id,
    })
}

impl SpotifyClient {
    /// `description` is given to every playlist this client creates.
    pub fn new(api_base: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            description: description.into(),
        }
    }

    async fn send(&self, req: RequestBuilder, kind: CallKind, what: &str) -> Result<Value, ClientError> {
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(Platform::Spotify, kind, what, resp).await);
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClientError::decode(Platform::Spotify, format!("{}: {}", what, e)))
    }

    async fn get(&self, session: &Session, url: &str, what: &str) -> Result<Value, ClientError> {
        let req = self
            .http
            .get(url)
            .header(AUTHORIZATION, session.bearer())
            .header(ACCEPT, "application/json");
        self.send(req, CallKind::Read, what).await
    }

    async fn user_id(&self, session: &Session) -> Result<String, ClientError> {
        if let Some(id) = &session.user_id {
            return Ok(id.clone());
        }
        let me = self.get(session, &format!("{}/me", self.api_base), "fetch /me").await?;
        me["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::decode(Platform::Spotify, "/me response has no id"))
    }
}

#[async_trait]
impl PlatformClient for SpotifyClient {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    async fn list_playlists(&self, session: &Session) -> Result<Vec<Playlist>, ClientError> {
        let mut playlists = Vec::new();
        let mut next = Some(format!("{}/me/playlists?limit=50", self.api_base));
        while let Some(url) = next {
            let page = self.get(session, &url, "list playlists").await?;
            for pl in page["items"].as_array().into_iter().flatten() {
                let (Some(id), Some(name)) = (pl["id"].as_str(), pl["name"].as_str()) else {
                    continue;
                };
                playlists.push(Playlist {
                    id: id.to_string(),
                    name: name.to_string(),
                    track_count: pl["tracks"]["total"].as_u64().unwrap_or(0) as u32,
                });
            }
            next = page["next"].as_str().map(String::from);
        }
        debug!("spotify: listed {} playlists", playlists.len());
        Ok(playlists)
    }

    async fn list_tracks(&self, session: &Session, playlist_id: &str) -> Result<Vec<Track>, ClientError> {
        let mut tracks = Vec::new();
        let mut next = Some(format!(
            "{}/playlists/{}/tracks?limit=100",
            self.api_base,
            urlencoding::encode(playlist_id)
        ));
        while let Some(url) = next {
            let page = self.get(session, &url, "list playlist tracks").await?;
            for item in page["items"].as_array().into_iter().flatten() {
                if let Some(t) = parse_track(&item["track"]) {
                    tracks.push(t);
                }
            }
            next = page["next"].as_str().map(String::from);
        }
        Ok(tracks)
    }

    async fn create_playlist(&self, session: &Session, name: &str) -> Result<String, ClientError> {
        let user_id = self.user_id(session).await?;
        let url = format!("{}/users/{}/playlists", self.api_base, urlencoding::encode(&user_id));
        let body = json!({
            "name": name,
            "description": self.description,
            "public": false
        });
        let req = self.http.post(&url).header(AUTHORIZATION, session.bearer()).json(&body);
        let created = self.send(req, CallKind::Mutation, "create playlist").await?;
        created["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::decode(Platform::Spotify, "created playlist has no id"))
    }

    async fn add_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let url = format!("{}/playlists/{}/tracks", self.api_base, urlencoding::encode(playlist_id));
        for chunk in track_ids.chunks(MUTATION_CHUNK) {
            let uris: Vec<String> = chunk.iter().map(|id| track_uri(id)).collect();
            let req = self
                .http
                .post(&url)
                .header(AUTHORIZATION, session.bearer())
                .json(&json!({ "uris": uris }));
            self.send(req, CallKind::Mutation, "add tracks").await?;
        }
        Ok(())
    }

    async fn remove_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let url = format!("{}/playlists/{}/tracks", self.api_base, urlencoding::encode(playlist_id));
        for chunk in track_ids.chunks(MUTATION_CHUNK) {
            let tracks: Vec<Value> = chunk.iter().map(|id| json!({ "uri": track_uri(id) })).collect();
            let req = self
                .http
                .delete(&url)
                .header(AUTHORIZATION, session.bearer())
                .json(&json!({ "tracks": tracks }));
            self.send(req, CallKind::Mutation, "remove tracks").await?;
        }
        Ok(())
    }

    async fn search_track(&self, session: &Session, query: &str) -> Result<Option<Track>, ClientError> {
        let url = format!(
            "{}/search?q={}&type=track&limit=1",
            self.api_base,
            urlencoding::encode(query)
        );
        let found = self.get(session, &url, "search").await?;
        Ok(found["tracks"]["items"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(parse_track))
    }
}

use super::{status_error, CallKind, PlatformClient};
use crate::auth::Session;
use crate::error::ClientError;
use crate::models::{Platform, Playlist, Track};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const JSON_API: &str = "application/vnd.api+json";
/// TIDAL rejects relationship bodies with more items than this.
const MUTATION_CHUNK: usize = 20;

/// TIDAL open API (v2, JSON:API) adapter.
pub struct TidalClient {
    http: Client,
    api_base: String,
    country_code: String,
    description: String,
}

/// `included` resources keyed by (type, id).
type Included<'a> = HashMap<(&'a str, &'a str), &'a Value>;

fn index_included(doc: &Value) -> Included<'_> {
    doc["included"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|r| Some(((r["type"].as_str()?, r["id"].as_str()?), r)))
        .collect()
}

fn related_ids<'a>(resource: &'a Value, relation: &str) -> Vec<&'a str> {
    resource["relationships"][relation]["data"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|d| d["id"].as_str())
        .collect()
}

fn track_from_resource(resource: &Value, included: &Included<'_>) -> Option<Track> {
    let id = resource["id"].as_str()?;
    let attrs = &resource["attributes"];
    let artists = related_ids(resource, "artists")
        .into_iter()
        .filter_map(|a| included.get(&("artists", a)))
        .filter_map(|a| a["attributes"]["name"].as_str().map(String::from))
        .collect();
    let album = related_ids(resource, "albums")
        .first()
        .and_then(|a| included.get(&("albums", *a)))
        .and_then(|a| a["attributes"]["title"].as_str())
        .unwrap_or_default()
        .to_string();
    Some(Track {
        id: id.to_string(),
        title: attrs["title"].as_str().unwrap_or_default().to_string(),
        artists,
        album,
        platform_uri: format!("tidal:track:{}", id),
    })
}

fn playlist_name(resource: &Value) -> Option<&str> {
    let attrs = &resource["attributes"];
    attrs["name"].as_str().or_else(|| attrs["title"].as_str())
}

/// Strip a `tidal:track:` prefix so ids and URIs can be passed interchangeably.
fn raw_track_id(id: &str) -> &str {
    id.rsplit(':').next().unwrap_or(id).trim()
}

impl TidalClient {
    pub fn new(
        api_base: impl Into<String>,
        country_code: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            country_code: country_code.into(),
            description: description.into(),
        }
    }

    fn absolute(&self, link: &str) -> String {
        if link.starts_with("http") {
            link.to_string()
        } else {
            format!("{}{}", self.api_base, link)
        }
    }

    async fn send(&self, req: RequestBuilder, kind: CallKind, what: &str) -> Result<Value, ClientError> {
        let resp = req.header(ACCEPT, JSON_API).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(Platform::Tidal, kind, what, resp).await);
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ClientError::decode(Platform::Tidal, format!("{}: {}", what, e)))
    }

    async fn get(&self, session: &Session, url: &str, what: &str) -> Result<Value, ClientError> {
        let req = self.http.get(url).header(AUTHORIZATION, session.bearer());
        self.send(req, CallKind::Read, what).await
    }

    /// Like [`Self::get`], but a 404 is `None` instead of an error.
    async fn get_optional(&self, session: &Session, url: &str, what: &str) -> Result<Option<Value>, ClientError> {
        let resp = self
            .http
            .get(url)
            .header(AUTHORIZATION, session.bearer())
            .header(ACCEPT, JSON_API)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(Platform::Tidal, CallKind::Read, what, resp).await);
        }
        let body = resp.text().await?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| ClientError::decode(Platform::Tidal, format!("{}: {}", what, e)))
    }

    /// A single track with its artists and album; `None` if TIDAL no longer has it.
    async fn fetch_track(&self, session: &Session, track_id: &str) -> Result<Option<Track>, ClientError> {
        let url = format!(
            "{}/tracks/{}?countryCode={}&include=artists,albums",
            self.api_base,
            urlencoding::encode(track_id),
            self.country_code
        );
        let Some(doc) = self.get_optional(session, &url, "fetch track").await? else {
            return Ok(None);
        };
        let included = index_included(&doc);
        Ok(track_from_resource(&doc["data"], &included))
    }

    async fn user_id(&self, session: &Session) -> Result<String, ClientError> {
        if let Some(id) = &session.user_id {
            return Ok(id.clone());
        }
        let me = self.get(session, &format!("{}/users/me", self.api_base), "fetch current user").await?;
        me["data"]["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::decode(Platform::Tidal, "current user response has no id"))
    }

    /// Playlist items as (track, item id) in playlist order. Tracks missing
    /// from `included` are fetched one by one; items whose track is gone are
    /// skipped. A 404 on the playlist means it has no items.
    async fn playlist_items(&self, session: &Session, playlist_id: &str) -> Result<Vec<(Track, String)>, ClientError> {
        let mut out = Vec::new();
        let mut next = Some(format!(
            "{}/playlists/{}/relationships/items?countryCode={}&include=items",
            self.api_base,
            urlencoding::encode(playlist_id),
            self.country_code
        ));
        while let Some(url) = next {
            let Some(page) = self.get_optional(session, &url, "list playlist items").await? else {
                debug!("tidal: playlist {} has no items", playlist_id);
                break;
            };
            let included = index_included(&page);
            for link in page["data"].as_array().into_iter().flatten() {
                if link["type"].as_str() != Some("tracks") {
                    continue;
                }
                let Some(id) = link["id"].as_str() else {
                    continue;
                };
                let item_id = link["meta"]["itemId"].as_str().unwrap_or(id).to_string();
                let resolved = included
                    .get(&("tracks", id))
                    .and_then(|r| track_from_resource(r, &included));
                let track = match resolved {
                    Some(t) => t,
                    None => match self.fetch_track(session, id).await? {
                        Some(t) => t,
                        None => {
                            debug!("tidal: skipping item {} of playlist {}, track {} is gone", item_id, playlist_id, id);
                            continue;
                        }
                    },
                };
                out.push((track, item_id));
            }
            next = page["links"]["next"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| self.absolute(s));
        }
        Ok(out)
    }
}

/// A search hit known only by id, when its resource was not included.
fn bare_track(id: &str) -> Track {
    Track {
        id: id.to_string(),
        title: String::new(),
        artists: Vec::new(),
        album: String::new(),
        platform_uri: format!("tidal:track:{}", id),
    }
}

#[async_trait]
impl PlatformClient for TidalClient {
    fn platform(&self) -> Platform {
        Platform::Tidal
    }

    async fn list_playlists(&self, session: &Session) -> Result<Vec<Playlist>, ClientError> {
        let user_id = self.user_id(session).await?;
        let mut playlists = Vec::new();
        let mut next = Some(format!(
            "{}/userCollections/{}/relationships/playlists?countryCode={}&include=playlists",
            self.api_base,
            urlencoding::encode(&user_id),
            self.country_code
        ));
        while let Some(url) = next {
            let page = self.get(session, &url, "list playlists").await?;
            let included = index_included(&page);
            for link in page["data"].as_array().into_iter().flatten() {
                let Some(id) = link["id"].as_str() else {
                    continue;
                };
                let resource = match included.get(&("playlists", id)) {
                    Some(r) => (*r).clone(),
                    None => {
                        // Relationship pages past the first may omit `included`.
                        let url = format!("{}/playlists/{}?countryCode={}", self.api_base, id, self.country_code);
                        match self.get_optional(session, &url, "fetch playlist").await? {
                            Some(doc) => doc["data"].clone(),
                            None => {
                                debug!("tidal: playlist {} is gone, skipping", id);
                                continue;
                            }
                        }
                    }
                };
                let Some(name) = playlist_name(&resource) else {
                    continue;
                };
                playlists.push(Playlist {
                    id: id.to_string(),
                    name: name.to_string(),
                    track_count: resource["attributes"]["numberOfItems"].as_u64().unwrap_or(0) as u32,
                });
            }
            next = page["links"]["next"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| self.absolute(s));
        }
        debug!("tidal: listed {} playlists", playlists.len());
        Ok(playlists)
    }

    async fn list_tracks(&self, session: &Session, playlist_id: &str) -> Result<Vec<Track>, ClientError> {
        Ok(self
            .playlist_items(session, playlist_id)
            .await?
            .into_iter()
            .map(|(track, _)| track)
            .collect())
    }

    async fn create_playlist(&self, session: &Session, name: &str) -> Result<String, ClientError> {
        let url = format!("{}/playlists?countryCode={}", self.api_base, self.country_code);
        let body = json!({
            "data": {
                "type": "playlists",
                "attributes": {
                    "name": name,
                    "description": self.description,
                    "accessType": "UNLISTED"
                }
            }
        });
        let req = self
            .http
            .post(&url)
            .header(AUTHORIZATION, session.bearer())
            .header(CONTENT_TYPE, JSON_API)
            .json(&body);
        let created = self.send(req, CallKind::Mutation, "create playlist").await?;
        created["data"]["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ClientError::decode(Platform::Tidal, "created playlist has no id"))
    }

    async fn add_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let url = format!(
            "{}/playlists/{}/relationships/items?countryCode={}",
            self.api_base,
            urlencoding::encode(playlist_id),
            self.country_code
        );
        for chunk in track_ids.chunks(MUTATION_CHUNK) {
            let data: Vec<Value> = chunk
                .iter()
                .map(|id| json!({ "type": "tracks", "id": raw_track_id(id) }))
                .collect();
            let req = self
                .http
                .post(&url)
                .header(AUTHORIZATION, session.bearer())
                .header(CONTENT_TYPE, JSON_API)
                .json(&json!({ "data": data }));
            self.send(req, CallKind::Mutation, "add tracks").await?;
        }
        Ok(())
    }

    async fn remove_tracks(&self, session: &Session, playlist_id: &str, track_ids: &[String]) -> Result<(), ClientError> {
        let wanted: HashSet<&str> = track_ids.iter().map(|id| raw_track_id(id)).collect();
        // Deletion is addressed by playlist item id, which only the listing exposes.
        let data: Vec<Value> = self
            .playlist_items(session, playlist_id)
            .await?
            .into_iter()
            .filter(|(track, _)| wanted.contains(track.id.as_str()))
            .map(|(track, item_id)| json!({ "type": "tracks", "id": track.id, "meta": { "itemId": item_id } }))
            .collect();
        if data.is_empty() {
            return Err(ClientError::modification(
                Platform::Tidal,
                crate::error::ModificationFailure::NotFound,
                format!("none of {} tracks are in playlist {}", track_ids.len(), playlist_id),
            ));
        }
        let url = format!(
            "{}/playlists/{}/relationships/items?countryCode={}",
            self.api_base,
            urlencoding::encode(playlist_id),
            self.country_code
        );
        for chunk in data.chunks(MUTATION_CHUNK) {
            let req = self
                .http
                .delete(&url)
                .header(AUTHORIZATION, session.bearer())
                .header(CONTENT_TYPE, JSON_API)
                .json(&json!({ "data": chunk }));
            self.send(req, CallKind::Mutation, "remove tracks").await?;
        }
        Ok(())
    }

    async fn search_track(&self, session: &Session, query: &str) -> Result<Option<Track>, ClientError> {
        let url = format!(
            "{}/searchResults/{}/relationships/tracks?countryCode={}&include=tracks",
            self.api_base,
            urlencoding::encode(query),
            self.country_code
        );
        let found = self.get(session, &url, "search").await?;
        let included = index_included(&found);
        let first = found["data"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|link| link["id"].as_str());
        Ok(first.map(|id| {
            included
                .get(&("tracks", id))
                .and_then(|r| track_from_resource(r, &included))
                .unwrap_or_else(|| bare_track(id))
        }))
    }
}

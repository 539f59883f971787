use chrono::{Duration, Utc};
use mockito::{Matcher, Server};
use serde_json::json;
use spotify_tidal_sync::api::tidal::TidalClient;
use spotify_tidal_sync::api::tidal_auth::TidalAuthenticator;
use spotify_tidal_sync::api::{AuthorizationRequest, Authenticator, DevicePoll, PlatformClient};
use spotify_tidal_sync::auth::Session;
use spotify_tidal_sync::config::TidalConfig;
use spotify_tidal_sync::error::{ClientError, ModificationFailure};
use spotify_tidal_sync::models::Platform;

fn session() -> Session {
    Session {
        platform: Platform::Tidal,
        access_token: "valid".into(),
        expires_at: Utc::now() + Duration::hours(1),
        user_id: Some("42".into()),
    }
}

fn client(base: &str) -> TidalClient {
    TidalClient::new(base, "US", "desc")
}

fn items_doc() -> serde_json::Value {
    json!({
        "data": [
            { "id": "7", "type": "tracks", "meta": { "itemId": "item-7" } },
            { "id": "8", "type": "tracks", "meta": { "itemId": "item-8" } },
            { "id": "v1", "type": "videos", "meta": { "itemId": "item-v1" } }
        ],
        "included": [
            { "id": "7", "type": "tracks", "attributes": { "title": "Song" },
              "relationships": { "artists": { "data": [{ "id": "a1", "type": "artists" }] } } },
            { "id": "a1", "type": "artists", "attributes": { "name": "Band" } }
        ],
        "links": {}
    })
}

#[tokio::test]
async fn list_playlists_reads_user_collection() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/userCollections/42/relationships/playlists")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("countryCode".into(), "US".into()),
            Matcher::UrlEncoded("include".into(), "playlists".into()),
        ]))
        .match_header("authorization", "Bearer valid")
        .with_status(200)
        .with_header("content-type", "application/vnd.api+json")
        .with_body(
            json!({
                "data": [{ "id": "pl-1", "type": "playlists" }, { "id": "pl-2", "type": "playlists" }],
                "included": [
                    { "id": "pl-1", "type": "playlists", "attributes": { "name": "Mix", "numberOfItems": 4 } }
                ],
                "links": {}
            })
            .to_string(),
        )
        .create_async()
        .await;
    // pl-2 was not included and is fetched on its own
    let _single = server
        .mock("GET", "/playlists/pl-2")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({ "data": { "id": "pl-2", "type": "playlists", "attributes": { "name": "Chill" } } }).to_string())
        .create_async()
        .await;

    let playlists = client(&server.url()).list_playlists(&session()).await.unwrap();
    let names: Vec<_> = playlists.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Mix", "Chill"]);
    assert_eq!(playlists[0].track_count, 4);
}

fn track_doc(id: &str, title: &str, artist: &str) -> String {
    json!({
        "data": { "id": id, "type": "tracks", "attributes": { "title": title },
                  "relationships": { "artists": { "data": [{ "id": "a9", "type": "artists" }] } } },
        "included": [{ "id": "a9", "type": "artists", "attributes": { "name": artist } }]
    })
    .to_string()
}

async fn mock_track(server: &mut Server, id: &str, status: usize, body: String) -> mockito::Mock {
    server
        .mock("GET", format!("/tracks/{}", id).as_str())
        .match_query(Matcher::Any)
        .with_status(status)
        .with_body(body)
        .create_async()
        .await
}

fn collection_with_unincluded_playlist() -> String {
    json!({
        "data": [{ "id": "pl-1", "type": "playlists" }, { "id": "pl-2", "type": "playlists" }],
        "included": [
            { "id": "pl-1", "type": "playlists", "attributes": { "name": "Mix" } }
        ],
        "links": {}
    })
    .to_string()
}

#[tokio::test]
async fn playlist_fetch_failure_fails_the_listing() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/userCollections/42/relationships/playlists")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(collection_with_unincluded_playlist())
        .create_async()
        .await;
    let _single = server
        .mock("GET", "/playlists/pl-2")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    // a partial listing would make "Chill" look absent and get it recreated
    let err = client(&server.url()).list_playlists(&session()).await.unwrap_err();
    assert!(matches!(err, ClientError::Transient { .. }));
}

#[tokio::test]
async fn vanished_playlist_is_skipped() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/userCollections/42/relationships/playlists")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(collection_with_unincluded_playlist())
        .create_async()
        .await;
    let _single = server
        .mock("GET", "/playlists/pl-2")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let playlists = client(&server.url()).list_playlists(&session()).await.unwrap();
    let names: Vec<_> = playlists.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Mix"]);
}

#[tokio::test]
async fn list_tracks_resolves_included_and_skips_videos() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(items_doc().to_string())
        .create_async()
        .await;
    // 8 is not in `included` and is fetched on its own
    let _t8 = mock_track(&mut server, "8", 200, track_doc("8", "Other", "Crew")).await;

    let tracks = client(&server.url()).list_tracks(&session(), "pl-1").await.unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].display_name(), "Song by Band");
    assert_eq!(tracks[1].display_name(), "Other by Crew");
    assert_eq!(tracks[1].platform_uri, "tidal:track:8");
}

#[tokio::test]
async fn deleted_tracks_are_left_out_of_the_listing() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(items_doc().to_string())
        .create_async()
        .await;
    let _t8 = mock_track(&mut server, "8", 404, String::new()).await;

    let tracks = client(&server.url()).list_tracks(&session(), "pl-1").await.unwrap();
    let ids: Vec<_> = tracks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["7"]);
}

#[tokio::test]
async fn failed_track_lookup_fails_the_listing() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(items_doc().to_string())
        .create_async()
        .await;
    let _t8 = mock_track(&mut server, "8", 503, String::new()).await;

    let err = client(&server.url()).list_tracks(&session(), "pl-1").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn missing_items_relationship_is_an_empty_playlist() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/playlists/fresh/relationships/items")
        .match_query(Matcher::Any)
        .with_status(404)
        .create_async()
        .await;

    let tracks = client(&server.url()).list_tracks(&session(), "fresh").await.unwrap();
    assert!(tracks.is_empty());
}

#[tokio::test]
async fn create_playlist_posts_json_api_document() {
    let mut server = Server::new_async().await;
    let create = server
        .mock("POST", "/playlists")
        .match_query(Matcher::UrlEncoded("countryCode".into(), "US".into()))
        .match_header("content-type", "application/vnd.api+json")
        .match_body(Matcher::PartialJson(json!({
            "data": { "type": "playlists", "attributes": { "name": "Mix", "accessType": "UNLISTED" } }
        })))
        .with_status(201)
        .with_body(json!({ "data": { "id": "new-pl", "type": "playlists" } }).to_string())
        .create_async()
        .await;

    let id = client(&server.url()).create_playlist(&session(), "Mix").await.unwrap();
    assert_eq!(id, "new-pl");
    create.assert_async().await;
}

#[tokio::test]
async fn add_tracks_accepts_uris_and_ids() {
    let mut server = Server::new_async().await;
    let add = server
        .mock("POST", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .match_body(Matcher::Json(json!({
            "data": [{ "type": "tracks", "id": "7" }, { "type": "tracks", "id": "9" }]
        })))
        .with_status(201)
        .create_async()
        .await;

    client(&server.url())
        .add_tracks(&session(), "pl-1", &["tidal:track:7".to_string(), "9".to_string()])
        .await
        .unwrap();
    add.assert_async().await;
}

#[tokio::test]
async fn remove_tracks_addresses_item_ids() {
    let mut server = Server::new_async().await;
    let _list = server
        .mock("GET", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(items_doc().to_string())
        .create_async()
        .await;
    let _t8 = mock_track(&mut server, "8", 200, track_doc("8", "Other", "Crew")).await;
    let delete = server
        .mock("DELETE", "/playlists/pl-1/relationships/items")
        .match_query(Matcher::Any)
        .match_body(Matcher::Json(json!({
            "data": [{ "type": "tracks", "id": "8", "meta": { "itemId": "item-8" } }]
        })))
        .with_status(204)
        .create_async()
        .await;

    let c = client(&server.url());
    c.remove_tracks(&session(), "pl-1", &["8".to_string()]).await.unwrap();
    delete.assert_async().await;

    let err = c.remove_tracks(&session(), "pl-1", &["99".to_string()]).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::PlaylistModification {
            kind: ModificationFailure::NotFound,
            ..
        }
    ));
}

#[tokio::test]
async fn search_resolves_first_hit() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", Matcher::Regex(r"^/searchResults/.+/relationships/tracks".into()))
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(
            json!({
                "data": [{ "id": "7", "type": "tracks" }],
                "included": [
                    { "id": "7", "type": "tracks", "attributes": { "title": "Song" },
                      "relationships": { "artists": { "data": [{ "id": "a1", "type": "artists" }] } } },
                    { "id": "a1", "type": "artists", "attributes": { "name": "Band" } }
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let hit = client(&server.url()).search_track(&session(), "Song Band").await.unwrap().unwrap();
    assert_eq!(hit.id, "7");
    assert_eq!(hit.artists, vec!["Band"]);
}

#[tokio::test]
async fn expired_token_is_an_auth_error() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/userCollections/42/relationships/playlists")
        .match_query(Matcher::Any)
        .with_status(401)
        .create_async()
        .await;

    let err = client(&server.url()).list_playlists(&session()).await.unwrap_err();
    assert!(err.is_authentication());
}

fn auth_config(base: &str) -> TidalConfig {
    TidalConfig {
        client_id: "cid".into(),
        auth_base: base.into(),
        ..TidalConfig::default()
    }
}

#[tokio::test]
async fn device_authorization_and_polling() {
    let mut server = Server::new_async().await;
    let _device = server
        .mock("POST", "/v1/oauth2/device_authorization")
        .match_body(Matcher::UrlEncoded("client_id".into(), "cid".into()))
        .with_status(200)
        .with_body(
            json!({
                "deviceCode": "dc-1",
                "userCode": "WXYZ",
                "verificationUriComplete": "link.tidal.com/WXYZ",
                "expiresIn": 300,
                "interval": 1
            })
            .to_string(),
        )
        .create_async()
        .await;

    let auth = TidalAuthenticator::new(&auth_config(&server.url()));
    let AuthorizationRequest::Device(device) = auth.begin().await.unwrap() else {
        panic!("expected the device flow");
    };
    assert_eq!(device.user_code, "WXYZ");
    assert_eq!(device.verification_uri, "https://link.tidal.com/WXYZ");

    let pending = server
        .mock("POST", "/v1/oauth2/token")
        .match_body(Matcher::UrlEncoded("device_code".into(), "dc-1".into()))
        .with_status(400)
        .with_body(r#"{"error":"authorization_pending"}"#)
        .create_async()
        .await;
    assert!(matches!(auth.poll_device(&device).await.unwrap(), DevicePoll::Pending));
    pending.remove_async().await;

    let _granted = server
        .mock("POST", "/v1/oauth2/token")
        .with_status(200)
        .with_body(
            json!({
                "access_token": "tidal-at",
                "refresh_token": "tidal-rt",
                "expires_in": 86400,
                "user": { "userId": 42 }
            })
            .to_string(),
        )
        .create_async()
        .await;
    let DevicePoll::Granted(grant) = auth.poll_device(&device).await.unwrap() else {
        panic!("expected a grant");
    };
    assert_eq!(grant.access_token, "tidal-at");
    assert_eq!(grant.user_id.as_deref(), Some("42"));
}

#[tokio::test]
async fn expired_device_code_is_an_auth_error() {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/v1/oauth2/token")
        .with_status(400)
        .with_body(r#"{"error":"expired_token"}"#)
        .create_async()
        .await;
    let auth = TidalAuthenticator::new(&auth_config(&server.url()));
    let device = spotify_tidal_sync::api::DeviceAuthorization {
        device_code: "dc-1".into(),
        user_code: "WXYZ".into(),
        verification_uri: "https://link.tidal.com/WXYZ".into(),
        interval: std::time::Duration::from_secs(1),
        expires_in: std::time::Duration::from_secs(300),
    };
    assert!(auth.poll_device(&device).await.unwrap_err().is_authentication());
}

#[tokio::test]
async fn refresh_keeps_token_shape() {
    let mut server = Server::new_async().await;
    let _token = server
        .mock("POST", "/v1/oauth2/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(200)
        .with_body(json!({ "access_token": "again", "expires_in": 3600, "user_id": 42 }).to_string())
        .create_async()
        .await;

    let auth = TidalAuthenticator::new(&auth_config(&server.url()));
    let grant = auth.refresh("tidal-rt").await.unwrap();
    assert_eq!(grant.access_token, "again");
    assert!(grant.refresh_token.is_none());
    assert_eq!(grant.user_id.as_deref(), Some("42"));
}

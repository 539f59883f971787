use chrono::{Duration, TimeZone, Utc};
use std::fs::File;
use std::io::Write;
use tempfile::tempdir;

use spotify_tidal_sync::config::Config;
use spotify_tidal_sync::db::{self, Store};
use spotify_tidal_sync::models::{CredentialRecord, Platform, Playlist, TokenPayload, Track};

#[test]
fn config_from_path_parses_toml() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    let mut f = File::create(&cfg_path).unwrap();
    let toml = r#"
db_path = "/tmp/test.db"
log_dir = "/tmp"

[spotify]
client_id = "sp-id"
redirect_uri = "http://127.0.0.1:9999/cb"

[tidal]
client_id = "td-id"
country_code = "NO"
"#;
    f.write_all(toml.as_bytes()).unwrap();
    let cfg = Config::from_path(&cfg_path).expect("parse config");
    assert_eq!(cfg.db_path.to_str().unwrap(), "/tmp/test.db");
    assert_eq!(cfg.spotify.redirect_uri, "http://127.0.0.1:9999/cb");
    assert_eq!(cfg.tidal.country_code, "NO");
    assert!(cfg.validate().is_empty());
}

#[test]
fn example_config_is_valid_toml() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/example-config.toml");
    let cfg = Config::from_path(&path).expect("example config parses");
    assert_eq!(cfg.retry.max_retries, 3);
}

#[test]
fn run_migrations_creates_tables() {
    let td = tempdir().unwrap();
    let conn = rusqlite::Connection::open(td.path().join("test.db")).unwrap();
    db::run_migrations(&conn).expect("run migrations");
    // idempotent
    db::run_migrations(&conn).expect("run migrations twice");
    for table in ["credentials", "playlists", "tracks", "track_matches"] {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |r| r.get(0),
            )
            .ok();
        assert!(found.is_some(), "{} table should exist after migrations", table);
    }
}

fn record(platform: Platform, token: &str) -> CredentialRecord {
    CredentialRecord {
        platform,
        secret: TokenPayload::V1 {
            access_token: token.into(),
            token_type: "Bearer".into(),
            refresh_token: Some("rt".into()),
            scope: Some("playlists.read".into()),
            user_id: Some("42".into()),
        },
        expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[test]
fn credential_upsert_is_one_row_per_platform() {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    store.save_credential(&record(Platform::Tidal, "first")).unwrap();
    store.save_credential(&record(Platform::Tidal, "second")).unwrap();

    let loaded = store.load_credential(Platform::Tidal).unwrap().unwrap();
    assert_eq!(loaded, record(Platform::Tidal, "second"));
    assert!(store.load_credential(Platform::Spotify).unwrap().is_none());

    store.delete_credential(Platform::Tidal).unwrap();
    assert!(store.load_credential(Platform::Tidal).unwrap().is_none());
}

#[test]
fn stored_secret_is_versioned_json() {
    let td = tempdir().unwrap();
    let path = td.path().join("sync.db");
    let store = Store::open(&path).unwrap();
    store.save_credential(&record(Platform::Spotify, "at")).unwrap();

    let conn = rusqlite::Connection::open(&path).unwrap();
    let secret: String = conn
        .query_row("SELECT secret FROM credentials WHERE platform = 'spotify'", [], |r| r.get(0))
        .unwrap();
    let v: serde_json::Value = serde_json::from_str(&secret).unwrap();
    assert_eq!(v["version"], "1");
    assert_eq!(v["access_token"], "at");
}

#[test]
fn expiry_boundary_is_exclusive() {
    let rec = record(Platform::Spotify, "at");
    assert!(rec.is_usable_at(rec.expires_at - Duration::seconds(1)));
    assert!(!rec.is_usable_at(rec.expires_at));
}

#[test]
fn playlist_cache_keeps_sync_stamp_across_listing() {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    let mix = Playlist {
        id: "p1".into(),
        name: "Mix".into(),
        track_count: 3,
    };
    store.upsert_playlists(Platform::Spotify, &[mix.clone()]).unwrap();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    store.mark_synced(Platform::Spotify, &mix, at).unwrap();

    let renamed = Playlist {
        name: "Mix 2".into(),
        track_count: 4,
        ..mix
    };
    store.upsert_playlists(Platform::Spotify, &[renamed]).unwrap();
    let cached = store.cached_playlists(Platform::Spotify).unwrap();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].name, "Mix 2");
    assert_eq!(cached[0].track_count, 4);
    assert_eq!(cached[0].last_synced_at, Some(at));
}

#[test]
fn purge_only_touches_one_platform() {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    let pl = |id: &str| Playlist {
        id: id.into(),
        name: id.into(),
        track_count: 0,
    };
    store.upsert_playlists(Platform::Spotify, &[pl("a"), pl("b")]).unwrap();
    store.upsert_playlists(Platform::Tidal, &[pl("c")]).unwrap();
    store.save_match(Platform::Spotify, "s1", Platform::Tidal, "t1").unwrap();

    assert_eq!(store.purge_platform(Platform::Spotify).unwrap(), 2);
    assert!(store.cached_playlists(Platform::Spotify).unwrap().is_empty());
    assert_eq!(store.cached_playlists(Platform::Tidal).unwrap().len(), 1);
    assert!(store.lookup_match(Platform::Spotify, "s1", Platform::Tidal).unwrap().is_none());
}

#[test]
fn track_cache_and_matches_round_trip() {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    let t = Track {
        id: "t1".into(),
        title: "Song".into(),
        artists: vec!["Band".into()],
        album: "LP".into(),
        platform_uri: "tidal:track:t1".into(),
    };
    store.cache_tracks(Platform::Tidal, &[t.clone()]).unwrap();
    assert_eq!(store.cached_track(Platform::Tidal, "t1").unwrap(), Some(t));
    assert!(store.cached_track(Platform::Spotify, "t1").unwrap().is_none());

    store.save_match(Platform::Spotify, "s1", Platform::Tidal, "t1").unwrap();
    store.save_match(Platform::Spotify, "s1", Platform::Tidal, "t2").unwrap();
    assert_eq!(
        store.lookup_match(Platform::Spotify, "s1", Platform::Tidal).unwrap().as_deref(),
        Some("t2")
    );
}

#[test]
fn matches_resolve_in_both_directions() {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    store.save_match(Platform::Spotify, "s1", Platform::Tidal, "t1").unwrap();

    assert_eq!(
        store.lookup_match(Platform::Tidal, "t1", Platform::Spotify).unwrap().as_deref(),
        Some("s1")
    );
    // a pair is only ever read back across the platforms it links
    assert!(store.lookup_match(Platform::Tidal, "s1", Platform::Spotify).unwrap().is_none());

    // a direct resolution wins over the inverse pair
    store.save_match(Platform::Tidal, "t1", Platform::Spotify, "s2").unwrap();
    assert_eq!(
        store.lookup_match(Platform::Tidal, "t1", Platform::Spotify).unwrap().as_deref(),
        Some("s2")
    );
}

#[test]
fn open_reports_unusable_directory() {
    let td = tempdir().unwrap();
    let blocker = td.path().join("not-a-dir");
    File::create(&blocker).unwrap();

    let err = match Store::open(&blocker.join("nested").join("sync.db")) {
        Ok(_) => panic!("opening under a file should fail"),
        Err(e) => e,
    };
    assert!(matches!(err, spotify_tidal_sync::error::StoreError::CreateDir { .. }), "{}", err);
    assert!(err.to_string().contains("not-a-dir"));
}

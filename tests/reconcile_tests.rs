use chrono::{Duration, Utc};
use spotify_tidal_sync::api::mock::{track, MockAuthenticator, MockCatalog};
use spotify_tidal_sync::api::Authenticator;
use spotify_tidal_sync::auth::SessionManager;
use spotify_tidal_sync::config::AuthConfig;
use spotify_tidal_sync::db::Store;
use spotify_tidal_sync::error::ModificationFailure;
use spotify_tidal_sync::models::{CredentialRecord, Platform, Playlist, TokenPayload};
use spotify_tidal_sync::retry::RetryPolicy;
use spotify_tidal_sync::sync::SyncManager;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tempfile::{tempdir, TempDir};

struct Fixture {
    _td: TempDir,
    spotify: Arc<MockCatalog>,
    tidal: Arc<MockCatalog>,
    manager: SyncManager,
}

fn seed_credential(store: &Store, platform: Platform) {
    store
        .save_credential(&CredentialRecord {
            platform,
            secret: TokenPayload::V1 {
                access_token: format!("{}-token", platform),
                token_type: "Bearer".into(),
                refresh_token: None,
                scope: None,
                user_id: Some("user-1".into()),
            },
            expires_at: Utc::now() + Duration::hours(1),
        })
        .unwrap();
}

fn fixture() -> Fixture {
    let td = tempdir().unwrap();
    let store = Store::open(&td.path().join("sync.db")).unwrap();
    seed_credential(&store, Platform::Spotify);
    seed_credential(&store, Platform::Tidal);
    let authenticators: Vec<Arc<dyn Authenticator>> = vec![
        Arc::new(MockAuthenticator::new(Platform::Spotify)),
        Arc::new(MockAuthenticator::new(Platform::Tidal)),
    ];
    let sessions = Arc::new(SessionManager::new(store.clone(), authenticators, &AuthConfig::default()));
    let spotify = Arc::new(MockCatalog::new(Platform::Spotify));
    let tidal = Arc::new(MockCatalog::new(Platform::Tidal));
    let manager = SyncManager::with_clients(store, sessions, spotify.clone(), tidal.clone(), RetryPolicy::immediate(2));
    Fixture {
        _td: td,
        spotify,
        tidal,
        manager,
    }
}

fn playlist(id: &str, name: &str) -> Playlist {
    Playlist {
        id: id.to_string(),
        name: name.to_string(),
        track_count: 0,
    }
}

fn as_set(ids: Vec<String>) -> HashSet<String> {
    ids.into_iter().collect()
}

/// Spotify "Mix" holds A, B, C; TIDAL "Mix" holds B, C, D.
fn mixed_fixture() -> (Fixture, String, String) {
    let f = fixture();
    let src = f.spotify.add_playlist(
        "Mix",
        vec![
            track("s-a", "Alpha", "Ann"),
            track("s-b", "Bravo", "Bob"),
            track("s-c", "Charlie", "Cid"),
        ],
    );
    f.tidal.add_searchable(track("t-a", "Alpha", "Ann"));
    let dst = f.tidal.add_playlist(
        "Mix",
        vec![
            track("t-b", "Bravo", "Bob"),
            track("t-c", "Charlie", "Cid"),
            track("t-d", "Delta", "Dee"),
        ],
    );
    (f, src, dst)
}

#[tokio::test]
async fn reconcile_adds_missing_and_removes_extra() {
    let (f, src, dst) = mixed_fixture();
    let report = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Mix"), Platform::Spotify)
        .await
        .expect("reconcile");

    assert!(!report.created);
    assert_eq!(report.target_playlist_id, dst);
    assert_eq!((report.added, report.removed, report.unmatched), (1, 1, 0));
    assert_eq!(
        as_set(f.tidal.track_ids(&dst)),
        as_set(vec!["t-a".into(), "t-b".into(), "t-c".into()])
    );
    // the source side is never written
    assert!(f.spotify.mutations().is_empty());
}

#[tokio::test]
async fn second_run_issues_no_mutations() {
    let (f, src, _dst) = mixed_fixture();
    let engine = f.manager.engine();
    engine.reconcile(&playlist(&src, "Mix"), Platform::Spotify).await.unwrap();
    f.tidal.clear_calls();

    let report = engine.reconcile(&playlist(&src, "Mix"), Platform::Spotify).await.unwrap();
    assert_eq!((report.added, report.removed), (0, 0));
    assert!(f.tidal.mutations().is_empty(), "unexpected: {:?}", f.tidal.mutations());
}

#[tokio::test]
async fn missing_target_is_created_once() {
    let f = fixture();
    let src = f.spotify.add_playlist("Road Trip", vec![track("s-1", "One", "Uno")]);
    f.tidal.add_searchable(track("t-1", "One", "Uno"));
    let engine = f.manager.engine();

    let first = engine.reconcile(&playlist(&src, "Road Trip"), Platform::Spotify).await.unwrap();
    assert!(first.created);
    assert_eq!(f.tidal.playlist_count(), 1);
    let created = f.tidal.playlist_named("Road Trip").unwrap();
    assert_eq!(f.tidal.track_ids(&created), vec!["t-1"]);

    let second = engine.reconcile(&playlist(&src, "Road Trip"), Platform::Spotify).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.target_playlist_id, created);
    assert_eq!(f.tidal.playlist_count(), 1);
}

#[tokio::test]
async fn unmatched_tracks_are_skipped() {
    let f = fixture();
    let src = f.spotify.add_playlist(
        "Rare",
        vec![track("s-1", "Known", "Band"), track("s-2", "Bootleg", "Nobody")],
    );
    f.tidal.add_searchable(track("t-1", "Known", "Band"));

    let report = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Rare"), Platform::Spotify)
        .await
        .unwrap();
    assert_eq!(report.unmatched, 1);
    assert_eq!(report.added, 1);
    let dst = f.tidal.playlist_named("Rare").unwrap();
    assert_eq!(f.tidal.track_ids(&dst), vec!["t-1"]);
}

/// Collects formatted log output for assertions.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(String::from)
            .collect()
    }
}

#[tokio::test]
async fn unmatched_track_is_warned_once_and_target_still_trimmed() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    // Alpha has no counterpart on TIDAL
    let f = fixture();
    let src = f.spotify.add_playlist(
        "Mix",
        vec![
            track("s-a", "Alpha", "Ann"),
            track("s-b", "Bravo", "Bob"),
            track("s-c", "Charlie", "Cid"),
        ],
    );
    let dst = f.tidal.add_playlist(
        "Mix",
        vec![
            track("t-b", "Bravo", "Bob"),
            track("t-c", "Charlie", "Cid"),
            track("t-d", "Delta", "Dee"),
        ],
    );

    let report = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Mix"), Platform::Spotify)
        .await
        .unwrap();
    assert_eq!((report.added, report.removed, report.unmatched), (0, 1, 1));
    assert_eq!(
        as_set(f.tidal.track_ids(&dst)),
        as_set(vec!["t-b".into(), "t-c".into()])
    );

    let warnings: Vec<String> = logs.lines().into_iter().filter(|l| l.contains("No match")).collect();
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    assert!(warnings[0].contains("Alpha by Ann"));
}

#[tokio::test]
async fn single_failed_add_does_not_abort_playlist() {
    let f = fixture();
    let src = f.spotify.add_playlist(
        "Mixed Bag",
        vec![track("s-1", "Good", "Band"), track("s-2", "Blocked", "Band")],
    );
    f.tidal.add_searchable(track("t-1", "Good", "Band"));
    f.tidal.add_searchable(track("t-2", "Blocked", "Band"));
    f.tidal.fail_add_of("t-2", ModificationFailure::Rejected);

    let report = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Mixed Bag"), Platform::Spotify)
        .await
        .unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn rejected_credential_aborts_with_auth_error() {
    let (f, src, dst) = mixed_fixture();
    f.tidal.reject_auth(true);

    let err = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Mix"), Platform::Spotify)
        .await
        .unwrap_err();
    assert!(err.is_authentication());
    assert_eq!(err.playlist, "Mix");
    f.tidal.reject_auth(false);
    assert_eq!(f.tidal.track_ids(&dst).len(), 3);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (f, src, dst) = mixed_fixture();
    f.tidal.fail_next(2);

    f.manager
        .engine()
        .reconcile(&playlist(&src, "Mix"), Platform::Spotify)
        .await
        .expect("retries absorb transient failures");
    assert!(f.tidal.track_ids(&dst).contains(&"t-a".to_string()));
}

#[tokio::test]
async fn reverse_direction_writes_spotify() {
    let f = fixture();
    let src = f.tidal.add_playlist("Chill", vec![track("t-9", "Nine", "Nina")]);
    f.spotify.add_searchable(track("s-9", "Nine", "Nina"));

    let report = f
        .manager
        .engine()
        .reconcile(&playlist(&src, "Chill"), Platform::Tidal)
        .await
        .unwrap();
    assert!(report.created);
    let dst = f.spotify.playlist_named("Chill").unwrap();
    assert_eq!(f.spotify.track_ids(&dst), vec!["s-9"]);
    assert!(f.tidal.mutations().is_empty());
}

#[tokio::test]
async fn remembered_matches_skip_search() {
    let (f, src, _dst) = mixed_fixture();
    let engine = f.manager.engine();
    engine.reconcile(&playlist(&src, "Mix"), Platform::Spotify).await.unwrap();
    f.tidal.clear_calls();

    engine.reconcile(&playlist(&src, "Mix"), Platform::Spotify).await.unwrap();
    let searches = f
        .tidal
        .calls()
        .into_iter()
        .filter(|c| matches!(c, spotify_tidal_sync::api::mock::Call::Search(_)))
        .count();
    assert_eq!(searches, 0);
}

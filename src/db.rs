use crate::error::StoreError;
use crate::models::{CredentialRecord, Platform, Playlist, PlaylistCacheEntry, TokenPayload, Track};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = include_str!("../db/schema.sql");

pub type Result<T> = std::result::Result<T, StoreError>;

/// Local persistence: credential records, the playlist metadata cache, a typed
/// track metadata cache and resolved track matches.
///
/// Every method performs one short statement (or one transaction) on a pooled
/// connection; nothing is held across a network call.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

pub fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

fn parse_ts(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp { value, source })
}

impl Store {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA busy_timeout = 5000;"));
        let pool = Pool::builder().max_size(4).build(manager)?;
        let store = Self { pool };
        run_migrations(&*store.conn()?)?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run a store operation on the blocking pool from async code.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -- credentials -------------------------------------------------------

    pub fn save_credential(&self, record: &CredentialRecord) -> Result<()> {
        let secret = serde_json::to_string(&record.secret)?;
        self.conn()?.execute(
            "INSERT INTO credentials (platform, secret, expires_at, updated_at) VALUES (?1, ?2, ?3, strftime('%s','now')) \
             ON CONFLICT(platform) DO UPDATE SET secret = excluded.secret, expires_at = excluded.expires_at, updated_at = excluded.updated_at",
            params![record.platform.as_str(), secret, record.expires_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load the raw record, expired or not. Expiry policy belongs to the caller.
    pub fn load_credential(&self, platform: Platform) -> Result<Option<CredentialRecord>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT secret, expires_at FROM credentials WHERE platform = ?1",
                params![platform.as_str()],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        let Some((secret, expires_at)) = row else {
            return Ok(None);
        };
        let secret: TokenPayload = serde_json::from_str(&secret)?;
        Ok(Some(CredentialRecord {
            platform,
            secret,
            expires_at: parse_ts(expires_at)?,
        }))
    }

    pub fn delete_credential(&self, platform: Platform) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM credentials WHERE platform = ?1",
            params![platform.as_str()],
        )?;
        Ok(())
    }

    // -- playlist cache ----------------------------------------------------

    /// Bulk upsert of a platform listing. Existing `last_synced_at` values survive.
    pub fn upsert_playlists(&self, platform: Platform, playlists: &[Playlist]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO playlists (platform, playlist_id, name, track_count) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(platform, playlist_id) DO UPDATE SET name = excluded.name, track_count = excluded.track_count",
            )?;
            for p in playlists {
                stmt.execute(params![platform.as_str(), p.id, p.name, p.track_count])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a completed sync of one playlist.
    pub fn mark_synced(&self, platform: Platform, playlist: &Playlist, at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO playlists (platform, playlist_id, name, track_count, last_synced_at) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(platform, playlist_id) DO UPDATE SET name = excluded.name, track_count = excluded.track_count, last_synced_at = excluded.last_synced_at",
            params![platform.as_str(), playlist.id, playlist.name, playlist.track_count, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn cached_playlists(&self, platform: Platform) -> Result<Vec<PlaylistCacheEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT playlist_id, name, track_count, last_synced_at FROM playlists WHERE platform = ?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, u32>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (playlist_id, name, track_count, synced) = row?;
            out.push(PlaylistCacheEntry {
                platform,
                playlist_id,
                name,
                track_count,
                last_synced_at: synced.map(parse_ts).transpose()?,
            });
        }
        Ok(out)
    }

    /// Drop every cached playlist, track and match involving `platform`.
    /// Returns the number of playlist rows removed.
    pub fn purge_platform(&self, platform: Platform) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM playlists WHERE platform = ?1", params![platform.as_str()])?;
        tx.execute("DELETE FROM tracks WHERE platform = ?1", params![platform.as_str()])?;
        tx.execute(
            "DELETE FROM track_matches WHERE source_platform = ?1 OR target_platform = ?1",
            params![platform.as_str()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    // -- track cache -------------------------------------------------------

    pub fn cache_tracks(&self, platform: Platform, tracks: &[Track]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO tracks (platform, track_id, metadata) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(platform, track_id) DO UPDATE SET metadata = excluded.metadata",
            )?;
            for t in tracks {
                stmt.execute(params![platform.as_str(), t.id, serde_json::to_string(t)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn cached_track(&self, platform: Platform, track_id: &str) -> Result<Option<Track>> {
        let meta = self
            .conn()?
            .query_row(
                "SELECT metadata FROM tracks WHERE platform = ?1 AND track_id = ?2",
                params![platform.as_str(), track_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(meta.map(|m| serde_json::from_str(&m)).transpose()?)
    }

    // -- resolved matches --------------------------------------------------

    pub fn save_match(&self, source: Platform, source_track_id: &str, target: Platform, target_track_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO track_matches (source_platform, source_track_id, target_platform, target_track_id, resolved_at) \
             VALUES (?1, ?2, ?3, ?4, strftime('%s','now')) \
             ON CONFLICT(source_platform, source_track_id, target_platform) DO UPDATE SET target_track_id = excluded.target_track_id, resolved_at = excluded.resolved_at",
            params![source.as_str(), source_track_id, target.as_str(), target_track_id],
        )?;
        Ok(())
    }

    /// Counterpart of `source_track_id` on `target`. A pair resolved in the
    /// other direction counts too, so a track we added is never searched back.
    pub fn lookup_match(&self, source: Platform, source_track_id: &str, target: Platform) -> Result<Option<String>> {
        let conn = self.conn()?;
        let forward = conn
            .query_row(
                "SELECT target_track_id FROM track_matches WHERE source_platform = ?1 AND source_track_id = ?2 AND target_platform = ?3",
                params![source.as_str(), source_track_id, target.as_str()],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        if forward.is_some() {
            return Ok(forward);
        }
        Ok(conn
            .query_row(
                "SELECT source_track_id FROM track_matches WHERE target_platform = ?1 AND target_track_id = ?2 AND source_platform = ?3 \
                 ORDER BY resolved_at DESC LIMIT 1",
                params![source.as_str(), source_track_id, target.as_str()],
                |r| r.get::<_, String>(0),
            )
            .optional()?)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the two catalogs being kept in step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Spotify,
    Tidal,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Spotify, Platform::Tidal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Spotify => "spotify",
            Platform::Tidal => "tidal",
        }
    }

    /// The other platform.
    pub fn complement(&self) -> Platform {
        match self {
            Platform::Spotify => Platform::Tidal,
            Platform::Tidal => Platform::Spotify,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotify" => Ok(Platform::Spotify),
            "tidal" => Ok(Platform::Tidal),
            other => Err(format!("invalid platform: {}", other)),
        }
    }
}

/// A track as seen by one platform. `id` is only meaningful on that platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub platform_uri: String,
}

impl Track {
    pub fn display_name(&self) -> String {
        if self.artists.is_empty() {
            self.title.clone()
        } else {
            format!("{} by {}", self.title, self.artists.join(", "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    pub id: String,
    pub name: String,
    pub track_count: u32,
}

/// Versioned token payload stored in the `secret` column of a credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum TokenPayload {
    #[serde(rename = "1")]
    V1 {
        access_token: String,
        token_type: String,
        refresh_token: Option<String>,
        scope: Option<String>,
        user_id: Option<String>,
    },
}

impl TokenPayload {
    pub fn access_token(&self) -> &str {
        match self {
            TokenPayload::V1 { access_token, .. } => access_token,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            TokenPayload::V1 { refresh_token, .. } => refresh_token.as_deref(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            TokenPayload::V1 { user_id, .. } => user_id.as_deref(),
        }
    }
}

/// Persisted bearer credential for one platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub platform: Platform,
    pub secret: TokenPayload,
    pub expires_at: DateTime<Utc>,
}

impl CredentialRecord {
    /// Usable only while strictly before its expiry.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Cached playlist metadata for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistCacheEntry {
    pub platform: Platform,
    pub playlist_id: String,
    pub name: String,
    pub track_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Result of a single-pair sync, handed back to interactive callers instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success { message: String },
    Error { message: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            SyncOutcome::Success { message } | SyncOutcome::Error { message } => message,
        }
    }
}

/// Final report of a batch sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Names never attempted: not found, or left over after cancellation / auth failure.
    pub skipped: Vec<String>,
}

impl SyncSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for name in &self.succeeded {
            writeln!(f, "  ok      {}", name)?;
        }
        for (name, reason) in &self.failed {
            writeln!(f, "  failed  {}: {}", name, reason)?;
        }
        for name in &self.skipped {
            writeln!(f, "  skipped {}", name)?;
        }
        Ok(())
    }
}

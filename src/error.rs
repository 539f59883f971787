use crate::models::Platform;
use std::time::Duration;
use thiserror::Error;

/// Why a remote playlist mutation was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModificationFailure {
    NotFound,
    RateLimited { retry_after: Option<Duration> },
    Malformed,
    Rejected,
}

impl std::fmt::Display for ModificationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModificationFailure::NotFound => write!(f, "not found"),
            ModificationFailure::RateLimited { retry_after: Some(d) } => {
                write!(f, "rate limited (retry after {}s)", d.as_secs())
            }
            ModificationFailure::RateLimited { retry_after: None } => write!(f, "rate limited"),
            ModificationFailure::Malformed => write!(f, "malformed request"),
            ModificationFailure::Rejected => write!(f, "rejected"),
        }
    }
}

/// Errors raised by the local SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("encoding stored value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid stored timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        source: chrono::ParseError,
    },
    #[error("creating database directory {}: {source}", path.display())]
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    #[error("blocking store task failed: {0}")]
    Join(String),
}

/// Errors raised by platform clients, the session manager and the retry policy.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Credential missing, expired or rejected. Never retried.
    #[error("{platform} authentication failed: {reason}")]
    Authentication { platform: Platform, reason: String },

    /// A remote add/remove/create was rejected.
    #[error("{platform} playlist modification failed ({kind}): {reason}")]
    PlaylistModification {
        platform: Platform,
        kind: ModificationFailure,
        reason: String,
    },

    /// Network hiccup, timeout, server error or read-side rate limit.
    #[error("{platform} transient failure: {reason}")]
    Transient {
        platform: Platform,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected {platform} response: {reason}")]
    Decode { platform: Platform, reason: String },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl ClientError {
    pub fn auth(platform: Platform, reason: impl Into<String>) -> Self {
        ClientError::Authentication {
            platform,
            reason: reason.into(),
        }
    }

    pub fn modification(platform: Platform, kind: ModificationFailure, reason: impl Into<String>) -> Self {
        ClientError::PlaylistModification {
            platform,
            kind,
            reason: reason.into(),
        }
    }

    pub fn transient(platform: Platform, reason: impl Into<String>) -> Self {
        ClientError::Transient {
            platform,
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn decode(platform: Platform, reason: impl Into<String>) -> Self {
        ClientError::Decode {
            platform,
            reason: reason.into(),
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ClientError::Authentication { .. })
    }

    /// Only transport failures, transient server conditions and rate-limited
    /// mutations are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transient { .. } | ClientError::Http(_) => true,
            ClientError::PlaylistModification {
                kind: ModificationFailure::RateLimited { .. },
                ..
            } => true,
            _ => false,
        }
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Transient { retry_after, .. } => *retry_after,
            ClientError::PlaylistModification {
                kind: ModificationFailure::RateLimited { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }
}

/// Failure to reconcile one playlist. Does not halt a multi-playlist batch.
#[derive(Debug, Error)]
#[error("error syncing playlist {playlist}: {source}")]
pub struct SyncError {
    pub playlist: String,
    #[source]
    pub source: ClientError,
}

impl SyncError {
    pub fn new(playlist: impl Into<String>, source: ClientError) -> Self {
        Self {
            playlist: playlist.into(),
            source,
        }
    }

    pub fn is_authentication(&self) -> bool {
        self.source.is_authentication()
    }
}

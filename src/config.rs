use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default)]
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub tidal: TidalConfig,

    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,

    /// Description given to playlists created on the target platform.
    #[serde(default = "default_playlist_description")]
    pub playlist_description: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpotifyConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_spotify_redirect")]
    pub redirect_uri: String,
    #[serde(default = "default_spotify_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_spotify_api_base")]
    pub api_base: String,
    #[serde(default = "default_spotify_auth_base")]
    pub auth_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TidalConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_tidal_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    #[serde(default = "default_tidal_api_base")]
    pub api_base: String,
    #[serde(default = "default_tidal_auth_base")]
    pub auth_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// How long the loopback listener waits for the OAuth redirect.
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_secs: u64,
    /// How long a code-for-token exchange may take.
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout_secs: u64,
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spotify-tidal-sync")
        .join("sync.db")
}
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spotify-tidal-sync")
        .join("logs")
}
fn default_playlist_description() -> String { "Created by Spotify-Tidal Sync".into() }
fn default_spotify_redirect() -> String { "http://127.0.0.1:8888/callback/spotify".into() }
fn default_spotify_scopes() -> Vec<String> {
    vec!["playlist-read-private", "playlist-modify-private", "playlist-modify-public"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_tidal_scopes() -> Vec<String> {
    vec!["playlists.read", "playlists.write", "search.read", "collection.read", "user.read"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_country_code() -> String { "US".into() }
fn default_spotify_api_base() -> String { "https://api.spotify.com/v1".into() }
fn default_spotify_auth_base() -> String { "https://accounts.spotify.com".into() }
fn default_tidal_api_base() -> String { "https://openapi.tidal.com/v2".into() }
fn default_tidal_auth_base() -> String { "https://auth.tidal.com".into() }
fn default_max_retries() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 1000 }
fn default_callback_timeout() -> u64 { 60 }
fn default_exchange_timeout() -> u64 { 30 }

impl Default for SpotifyConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: default_spotify_redirect(),
            scopes: default_spotify_scopes(),
            api_base: default_spotify_api_base(),
            auth_base: default_spotify_auth_base(),
        }
    }
}

impl Default for TidalConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scopes: default_tidal_scopes(),
            country_code: default_country_code(),
            api_base: default_tidal_api_base(),
            auth_base: default_tidal_auth_base(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: default_max_retries(), base_delay_ms: default_base_delay_ms() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            callback_timeout_secs: default_callback_timeout(),
            exchange_timeout_secs: default_exchange_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            spotify: SpotifyConfig::default(),
            tidal: TidalConfig::default(),
            retry: RetryConfig::default(),
            auth: AuthConfig::default(),
            playlist_description: default_playlist_description(),
        }
    }
}

impl AuthConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// Problems that would make every sync fail; empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.spotify.client_id.trim().is_empty() {
            problems.push("spotify.client_id is empty (set it or SPOTIFY_CLIENT_ID)".to_string());
        }
        if self.tidal.client_id.trim().is_empty() {
            problems.push("tidal.client_id is empty (set it or TIDAL_CLIENT_ID)".to_string());
        }
        match url::Url::parse(&self.spotify.redirect_uri) {
            Ok(u) if u.port_or_known_default().is_some() => {}
            _ => problems.push(format!("spotify.redirect_uri {:?} is not a usable URL", self.spotify.redirect_uri)),
        }
        if self.auth.callback_timeout_secs == 0 || self.auth.exchange_timeout_secs == 0 {
            problems.push("auth timeouts must be positive".to_string());
        }
        problems
    }

    /// Let environment variables override client credentials, API endpoints and
    /// the database path.
    pub fn apply_env(&mut self) {
        self.apply_vars(|k| std::env::var(k).ok());
    }

    fn apply_vars(&mut self, get: impl Fn(&str) -> Option<String>) {
        let non_empty = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("SPOTIFY_CLIENT_ID") { self.spotify.client_id = v; }
        if let Some(v) = non_empty("SPOTIFY_CLIENT_SECRET") { self.spotify.client_secret = v; }
        if let Some(v) = non_empty("SPOTIFY_REDIRECT_URI") { self.spotify.redirect_uri = v; }
        if let Some(v) = non_empty("TIDAL_CLIENT_ID") { self.tidal.client_id = v; }
        if let Some(v) = non_empty("TIDAL_CLIENT_SECRET") { self.tidal.client_secret = v; }
        if let Some(v) = non_empty("TIDAL_COUNTRY_CODE") { self.tidal.country_code = v; }
        if let Some(v) = non_empty("SPOTIFY_API_BASE") { self.spotify.api_base = v; }
        if let Some(v) = non_empty("SPOTIFY_AUTH_BASE") { self.spotify.auth_base = v; }
        if let Some(v) = non_empty("TIDAL_API_BASE") { self.tidal.api_base = v; }
        if let Some(v) = non_empty("TIDAL_AUTH_BASE") { self.tidal.auth_base = v; }
        if let Some(v) = non_empty("DATABASE_PATH") { self.db_path = PathBuf::from(v); }
    }
}

use super::pkce::PkcePair;
use super::{AuthorizationRequest, Authenticator, TokenGrant};
use crate::config::SpotifyConfig;
use crate::error::ClientError;
use crate::models::Platform;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use tracing::debug;
use url::Url;

/// Authorization-code flow with PKCE against the Spotify accounts service.
///
/// The client secret is optional: when configured it is sent as HTTP Basic
/// auth on the token endpoint, otherwise the PKCE verifier alone proves the
/// caller.
pub struct SpotifyAuthenticator {
    http: Client,
    auth_base: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl SpotifyAuthenticator {
    pub fn new(cfg: &SpotifyConfig) -> Self {
        Self {
            http: Client::new(),
            auth_base: cfg.auth_base.trim_end_matches('/').to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
            scopes: cfg.scopes.clone(),
        }
    }

    fn authorization_url(&self, pkce: &PkcePair) -> Result<String, ClientError> {
        let mut url = Url::parse(&format!("{}/authorize", self.auth_base))
            .map_err(|e| ClientError::auth(Platform::Spotify, format!("invalid auth base: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", self.client_id.as_str())
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", &pkce.state)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &pkce.code_challenge);
        Ok(url.into())
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, ClientError> {
        let mut req = self.http.post(format!("{}/api/token", self.auth_base)).form(params);
        if !self.client_secret.is_empty() {
            let basic = general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
            req = req.header(AUTHORIZATION, format!("Basic {}", basic));
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(ClientError::transient(Platform::Spotify, format!("token endpoint: {} => {}", status, body)));
        }
        if !status.is_success() {
            return Err(ClientError::auth(Platform::Spotify, format!("token endpoint: {} => {}", status, body)));
        }
        serde_json::from_str(&body).map_err(|e| ClientError::auth(Platform::Spotify, format!("malformed token response: {}", e)))
    }
}

#[async_trait]
impl Authenticator for SpotifyAuthenticator {
    fn platform(&self) -> Platform {
        Platform::Spotify
    }

    async fn begin(&self) -> Result<AuthorizationRequest, ClientError> {
        if self.client_id.is_empty() {
            return Err(ClientError::auth(Platform::Spotify, "spotify.client_id is not configured"));
        }
        let pkce = PkcePair::generate();
        let url = self.authorization_url(&pkce)?;
        debug!("spotify: authorization url built for redirect {}", self.redirect_uri);
        Ok(AuthorizationRequest::Redirect {
            url,
            redirect_uri: self.redirect_uri.clone(),
            state: pkce.state,
            code_verifier: pkce.code_verifier,
        })
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str, redirect_uri: &str) -> Result<TokenGrant, ClientError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", code_verifier),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ClientError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authorization_url_carries_pkce_and_state() {
        let cfg = SpotifyConfig {
            client_id: "cid".into(),
            ..SpotifyConfig::default()
        };
        let auth = SpotifyAuthenticator::new(&cfg);
        let AuthorizationRequest::Redirect { url, state, code_verifier, .. } = auth.begin().await.unwrap() else {
            panic!("expected a redirect flow");
        };
        let parsed = Url::parse(&url).unwrap();
        let q: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(q["client_id"], "cid");
        assert_eq!(q["state"], state);
        assert_eq!(q["code_challenge_method"], "S256");
        assert_eq!(q["code_challenge"], super::super::pkce::code_challenge_s256(&code_verifier));
        assert_eq!(q["redirect_uri"], "http://127.0.0.1:8888/callback/spotify");
    }

    #[tokio::test]
    async fn begin_requires_client_id() {
        let auth = SpotifyAuthenticator::new(&SpotifyConfig::default());
        assert!(auth.begin().await.unwrap_err().is_authentication());
    }
}

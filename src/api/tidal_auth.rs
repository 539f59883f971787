use super::{AuthorizationRequest, Authenticator, DeviceAuthorization, DevicePoll, TokenGrant};
use crate::config::TidalConfig;
use crate::error::ClientError;
use crate::models::Platform;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEVICE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Device-code flow against the TIDAL auth service.
pub struct TidalAuthenticator {
    http: Client,
    auth_base: String,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceResponse {
    device_code: String,
    user_code: String,
    #[serde(default)]
    verification_uri: Option<String>,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_expires_in() -> u64 {
    300
}
fn default_interval() -> u64 {
    2
}

fn with_scheme(uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("https://{}", uri)
    }
}

/// TIDAL reports the user id as a number, either at the top level or under `user`.
fn grant_from_json(j: &Value) -> Result<TokenGrant, ClientError> {
    let access_token = j["access_token"]
        .as_str()
        .ok_or_else(|| ClientError::auth(Platform::Tidal, "token response has no access_token"))?
        .to_string();
    let id_of = |v: &Value| v.as_str().map(String::from).or_else(|| v.as_i64().map(|n| n.to_string()));
    Ok(TokenGrant {
        access_token,
        token_type: j["token_type"].as_str().unwrap_or("Bearer").to_string(),
        refresh_token: j["refresh_token"].as_str().map(String::from),
        scope: j["scope"].as_str().map(String::from),
        expires_in: j["expires_in"].as_i64().unwrap_or(3600),
        user_id: id_of(&j["user_id"]).or_else(|| id_of(&j["user"]["userId"])),
    })
}

impl TidalAuthenticator {
    pub fn new(cfg: &TidalConfig) -> Self {
        Self {
            http: Client::new(),
            auth_base: cfg.auth_base.trim_end_matches('/').to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            scopes: cfg.scopes.clone(),
        }
    }

    fn with_client_auth(&self, req: RequestBuilder) -> RequestBuilder {
        if self.client_secret.is_empty() {
            return req;
        }
        let basic = general_purpose::STANDARD.encode(format!("{}:{}", self.client_id, self.client_secret));
        req.header(AUTHORIZATION, format!("Basic {}", basic))
    }

    /// POST to the token endpoint. Returns the status and parsed body.
    async fn token_request(&self, params: &[(&str, &str)]) -> Result<(reqwest::StatusCode, Value), ClientError> {
        let url = format!("{}/v1/oauth2/token", self.auth_base);
        let resp = self.with_client_auth(self.http.post(&url).form(params)).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(ClientError::transient(Platform::Tidal, format!("token endpoint: {} => {}", status, body)));
        }
        let j = serde_json::from_str(&body).unwrap_or(Value::Null);
        Ok((status, j))
    }
}

#[async_trait]
impl Authenticator for TidalAuthenticator {
    fn platform(&self) -> Platform {
        Platform::Tidal
    }

    async fn begin(&self) -> Result<AuthorizationRequest, ClientError> {
        if self.client_id.is_empty() {
            return Err(ClientError::auth(Platform::Tidal, "tidal.client_id is not configured"));
        }
        let url = format!("{}/v1/oauth2/device_authorization", self.auth_base);
        let scope = self.scopes.join(" ");
        let resp = self
            .http
            .post(&url)
            .form(&[("client_id", self.client_id.as_str()), ("scope", scope.as_str())])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(ClientError::auth(
                Platform::Tidal,
                format!("device authorization failed: {} => {}", status, body),
            ));
        }
        let d: DeviceResponse = serde_json::from_str(&body)
            .map_err(|e| ClientError::auth(Platform::Tidal, format!("malformed device authorization: {}", e)))?;
        let verification_uri = d
            .verification_uri_complete
            .or(d.verification_uri)
            .map(|u| with_scheme(&u))
            .unwrap_or_else(|| "https://link.tidal.com".to_string());
        debug!("tidal: device code issued, polling every {}s", d.interval);
        Ok(AuthorizationRequest::Device(DeviceAuthorization {
            device_code: d.device_code,
            user_code: d.user_code,
            verification_uri,
            interval: Duration::from_secs(d.interval),
            expires_in: Duration::from_secs(d.expires_in),
        }))
    }

    async fn poll_device(&self, device: &DeviceAuthorization) -> Result<DevicePoll, ClientError> {
        let scope = self.scopes.join(" ");
        let (status, j) = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("device_code", device.device_code.as_str()),
                ("grant_type", DEVICE_GRANT),
                ("scope", scope.as_str()),
            ])
            .await?;
        if status.is_success() {
            return Ok(DevicePoll::Granted(grant_from_json(&j)?));
        }
        match j["error"].as_str() {
            Some("authorization_pending") => Ok(DevicePoll::Pending),
            Some("slow_down") => Ok(DevicePoll::SlowDown),
            other => Err(ClientError::auth(
                Platform::Tidal,
                format!("device authorization failed: {} ({})", status, other.unwrap_or("no error code")),
            )),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ClientError> {
        let scope = self.scopes.join(" ");
        let (status, j) = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", scope.as_str()),
            ])
            .await?;
        if !status.is_success() {
            return Err(ClientError::auth(Platform::Tidal, format!("token refresh rejected: {} => {}", status, j)));
        }
        grant_from_json(&j)
    }
}

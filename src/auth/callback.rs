use crate::error::ClientError;
use crate::models::Platform;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type ParamSender = Arc<Mutex<Option<oneshot::Sender<HashMap<String, String>>>>>;

/// One-shot loopback HTTP listener for an OAuth redirect.
///
/// Accepts exactly one request on `path`. The server is shut down when the
/// listener is dropped, whether or not a request arrived.
pub struct CallbackListener {
    platform: Platform,
    addr: SocketAddr,
    params: Option<oneshot::Receiver<HashMap<String, String>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

async fn receive(
    State(tx): State<ParamSender>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let sender = tx.lock().ok().and_then(|mut g| g.take());
    match sender {
        Some(sender) => {
            let failed = params.contains_key("error") || !params.contains_key("code");
            let _ = sender.send(params);
            if failed {
                Html("<h3>Login failed.</h3><p>You can close this window.</p>")
            } else {
                Html("<h3>Authentication successful.</h3><p>You can close this window.</p>")
            }
        }
        None => Html("<h3>This login link was already used.</h3>"),
    }
}

impl CallbackListener {
    pub async fn bind(platform: Platform, addr: SocketAddr, path: &str) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientError::auth(platform, format!("cannot listen on {} for the login redirect: {}", addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ClientError::auth(platform, e.to_string()))?;

        let (param_tx, param_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state: ParamSender = Arc::new(Mutex::new(Some(param_tx)));
        let app = Router::new().route(path, get(receive)).with_state(state);

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                warn!("callback listener stopped with error: {}", e);
            }
            debug!("callback listener on {} shut down", addr);
        });
        debug!("{}: waiting for login redirect on http://{}{}", platform, addr, path);

        Ok(Self {
            platform,
            addr,
            params: Some(param_rx),
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait up to `timeout` for the redirect and return its authorization code.
    /// The `state` query parameter must equal `expected_state`.
    pub async fn wait(mut self, expected_state: &str, timeout: Duration) -> Result<String, ClientError> {
        let platform = self.platform;
        let rx = self
            .params
            .take()
            .ok_or_else(|| ClientError::auth(platform, "callback listener already consumed"))?;
        let params = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(ClientError::auth(platform, "callback listener closed before a redirect arrived")),
            Err(_) => {
                return Err(ClientError::auth(
                    platform,
                    format!("no login redirect received within {}s", timeout.as_secs()),
                ))
            }
        };
        if let Some(err) = params.get("error") {
            return Err(ClientError::auth(platform, format!("authorization denied: {}", err)));
        }
        if params.get("state").map(String::as_str) != Some(expected_state) {
            return Err(ClientError::auth(platform, "state mismatch in login redirect"));
        }
        params
            .get("code")
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| ClientError::auth(platform, "login redirect carried no authorization code"))
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::protocol::{RpcError, RpcRequest};

pub const TESTNET_REST_URL: &str = "https://test.deribit.com";
pub const MAINNET_REST_URL: &str = "https://www.deribit.com";
pub const TESTNET_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";
pub const MAINNET_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// API key pair for the `client_credentials` grant.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn auth_params(&self) -> Value {
        json!({
            "grant_type": "client_credentials",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Result of `public/auth`.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

struct Token {
    access_token: String,
    refresh_token: String,
    expires_at: Instant,
}

impl Token {
    fn from_auth(auth: AuthResult) -> Self {
        Self {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            expires_at: Instant::now() + Duration::from_secs(auth.expires_in),
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Deribit JSON-RPC over HTTP.
///
/// Private methods carry a bearer token. An expired token gets exactly one
/// refresh attempt before the call fails with an auth error.
pub struct DeribitClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    token: Mutex<Option<Token>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl DeribitClient {
    /// `base_url` should be either [`TESTNET_REST_URL`] or [`MAINNET_REST_URL`]
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            token: Mutex::new(None),
            next_id: AtomicU64::new(1),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.token.lock().await.is_some()
    }

    async fn post_rpc(&self, method: &str, params: &Value, bearer: Option<&str>) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/api/v2/{}", self.base_url, method);
        debug!(url = %url, id, "POST request");

        let mut req = self.http.post(&url).json(&RpcRequest::new(id, method, params));
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| self.map_reqwest(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.map_reqwest(e))?;

        // Deribit reports RPC errors with a 4xx status and a JSON body
        let envelope: RpcEnvelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(GatewayError::Protocol(format!("invalid response body: {}", e)))
            }
            Err(_) => return Err(GatewayError::Transport(format!("HTTP {}", status))),
        };

        match envelope {
            RpcEnvelope { error: Some(err), .. } => {
                warn!(method, code = err.code, message = %err.message, "rpc error");
                Err(err.into())
            }
            RpcEnvelope { result, .. } => Ok(result.unwrap_or(Value::Null)),
        }
    }

    fn map_reqwest(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            GatewayError::Transport(e.to_string())
        }
    }

    /// Authenticate with the `client_credentials` grant.
    pub async fn authenticate(&self) -> Result<AuthResult, GatewayError> {
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Auth("no credentials configured".into()))?;

        let mut token = self.token.lock().await;
        let result = self
            .post_rpc("public/auth", &creds.auth_params(), None)
            .await
            .map_err(|e| GatewayError::Auth(format!("authentication failed: {}", e)))?;
        let auth: AuthResult = serde_json::from_value(result)?;

        info!(expires_in = auth.expires_in, "authenticated with Deribit");
        *token = Some(Token::from_auth(auth.clone()));
        Ok(auth)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token, GatewayError> {
        let params = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        let result = self.post_rpc("public/auth", &params, None).await?;
        let auth: AuthResult = serde_json::from_value(result)?;
        Ok(Token::from_auth(auth))
    }

    /// Current access token, refreshing once if it has expired.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut guard = self.token.lock().await;
        let Some(token) = guard.as_ref() else {
            return Err(GatewayError::Auth("not authenticated".into()));
        };

        if !token.is_expired() {
            return Ok(token.access_token.clone());
        }

        debug!("access token expired, refreshing");
        match self.refresh(&token.refresh_token).await {
            Ok(fresh) => {
                let access = fresh.access_token.clone();
                *guard = Some(fresh);
                info!("access token refreshed");
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                *guard = None;
                Err(GatewayError::Auth("failed to refresh token".into()))
            }
        }
    }
}

#[async_trait]
impl Gateway for DeribitClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        if method.starts_with("private/") {
            let token = self.access_token().await?;
            self.post_rpc(method, &params, Some(&token)).await
        } else {
            self.post_rpc(method, &params, None).await
        }
    }
}

//! Firmware HTTP client

use reqwest::{Client as HttpClient, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::types::*;

const API_PREFIX: &str = "/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BODY_LIMIT: usize = 2048;

/// Result type alias for firmware calls
pub type Result<T> = std::result::Result<T, FirmwareError>;

/// Firmware client errors
#[derive(Error, Debug)]
pub enum FirmwareError {
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("firmware {method} {endpoint}: {status} {body}")]
    Api {
        method: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("decode {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        source: reqwest::Error,
    },

    #[error("unlock succeeded but token is empty")]
    EmptyToken,
}

/// Client for a single miner's firmware API.
///
/// Authentication: each call first tries a per-call bearer token, then
/// the stored API key. Every request is bounded by the client timeout;
/// callers layer tighter deadlines on top where needed.
pub struct Client {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl Client {
    /// Build a client for a device address (`10.0.0.5` or a full URL)
    /// with the default request timeout.
    pub fn new(addr: &str) -> Result<Self> {
        let http = HttpClient::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Self::with_http_client(addr, http)
    }

    /// Build a client reusing an existing `reqwest::Client`, so a
    /// worker pool can share one connection pool and timeout across
    /// devices.
    pub fn with_http_client(addr: &str, http: HttpClient) -> Result<Self> {
        Ok(Self {
            http,
            base_url: derive_base_url(addr)?,
            api_key: None,
        })
    }

    /// Set the stored API key, consuming style.
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.set_api_key(key);
        self
    }

    /// Set or clear the stored API key.
    pub fn set_api_key(&mut self, key: &str) {
        let key = key.trim();
        self.api_key = (!key.is_empty()).then(|| key.to_string());
    }

    /// Exchange the device password for a short-lived bearer token.
    pub async fn unlock(&self, password: &str) -> Result<String> {
        let res: UnlockResponse = self
            .request(Method::POST, "/unlock", Some(json!({ "pw": password })), None, None)
            .await?;
        let token = res.token.trim().to_string();
        if token.is_empty() {
            return Err(FirmwareError::EmptyToken);
        }
        Ok(token)
    }

    /// List API keys registered on the device.
    pub async fn list_api_keys(&self, bearer: &str) -> Result<Vec<ApiKeyEntry>> {
        self.request(Method::GET, "/apikeys", None, Some(bearer), None)
            .await
    }

    /// Register a new API key on the device.
    pub async fn create_api_key(&self, bearer: &str, key: &str, description: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/apikeys",
            Some(json!({ "key": key, "description": description })),
            Some(bearer),
            None,
        )
        .await
    }

    /// Remove an API key from the device.
    pub async fn delete_api_key(&self, bearer: &str, key: &str) -> Result<()> {
        self.request_unit(
            Method::POST,
            "/apikeys/delete",
            Some(json!({ "key": key })),
            Some(bearer),
            None,
        )
        .await
    }

    /// General device metadata. No auth required.
    pub async fn info(&self) -> Result<InfoResponse> {
        self.request(Method::GET, "/info", None, None, None).await
    }

    /// Model metadata. No auth required.
    pub async fn model(&self) -> Result<ModelResponse> {
        self.request(Method::GET, "/model", None, None, None).await
    }

    /// Lightweight device state.
    pub async fn status(&self) -> Result<StatusResponse> {
        self.request(Method::GET, "/status", None, None, None).await
    }

    /// Full miner summary, including cooling and chain metrics.
    pub async fn summary(&self) -> Result<SummaryResponse> {
        self.request(Method::GET, "/summary", None, None, None).await
    }

    /// Autotune state; carries the opaque `current_preset`.
    pub async fn perf_summary(&self) -> Result<PerfSummaryResponse> {
        self.request(Method::GET, "/perf-summary", None, None, None)
            .await
    }

    /// Per-chip telemetry for each hashboard.
    pub async fn chains(&self) -> Result<Vec<ChainTelemetry>> {
        self.request(Method::GET, "/chains", None, None, None).await
    }

    /// Available performance presets.
    pub async fn autotune_presets(&self, bearer: Option<&str>) -> Result<Vec<AutotunePreset>> {
        self.request(Method::GET, "/autotune/presets", None, bearer, None)
            .await
    }

    /// Change the active preset. Sends the minimal settings payload so
    /// nothing else on the device is touched.
    pub async fn set_preset(&self, api_key: &str, preset: &str) -> Result<SaveConfigResult> {
        let payload = SetPresetRequest {
            miner: MinerConfig {
                overclock: OverclockSettings {
                    preset: preset.to_string(),
                },
            },
        };
        self.request(
            Method::POST,
            "/settings",
            Some(serde_json::to_value(&payload)?),
            None,
            Some(api_key),
        )
        .await
    }

    /// Restart the mining process (not a reboot).
    pub async fn restart_mining(&self, api_key: &str) -> Result<()> {
        self.request_unit(Method::POST, "/restart", None, None, Some(api_key))
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<T> {
        let response = self.send(method, endpoint, body, bearer, api_key).await?;
        response
            .json()
            .await
            .map_err(|source| FirmwareError::Decode {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    async fn request_unit(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<()> {
        self.send(method, endpoint, body, bearer, api_key).await?;
        Ok(())
    }

    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut request = self.http.request(method.clone(), &url);

        if let Some(body) = &body {
            request = request.json(body);
        }
        if let Some(bearer) = bearer.map(str::trim).filter(|b| !b.is_empty()) {
            request = request.bearer_auth(bearer);
        }
        let api_key = api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or(self.api_key.as_deref());
        if let Some(key) = api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
            return Err(FirmwareError::Api {
                method: method.to_string(),
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

/// Turn a device address into the API base URL, e.g.
/// `10.0.0.5` → `http://10.0.0.5/api/v1`.
fn derive_base_url(addr: &str) -> Result<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(FirmwareError::InvalidAddress("address is empty".into()));
    }

    let addr = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };

    let mut url = reqwest::Url::parse(&addr)
        .map_err(|e| FirmwareError::InvalidAddress(format!("{addr}: {e}")))?;
    url.set_query(None);
    url.set_fragment(None);

    Ok(format!(
        "{}{}",
        url.as_str().trim_end_matches('/'),
        API_PREFIX
    ))
}

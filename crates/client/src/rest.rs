//! Reqwest-backed [`ApiClient`] for the real service.

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::{ApiClient, ApiError, ApiRequest, ApiResponse, Method, SecretRef, SecretResolver};

const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

fn default_api_version() -> String {
    std::env::var("STEWARD_API_VERSION").unwrap_or_else(|_| "7.0".to_string())
}

fn request_timeout() -> std::time::Duration {
    let secs = std::env::var("STEWARD_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    std::time::Duration::from_secs(secs)
}

/// REST client bound to one organization. The auth token sits behind an
/// `ArcSwap` so rotation never blocks in-flight requests; an auth failure
/// triggers one re-resolve-and-retry before the error surfaces.
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    token: ArcSwap<String>,
    secrets: Arc<dyn SecretResolver>,
    secret_ref: SecretRef,
    api_version: String,
}

impl RestClient {
    /// `base` is the organization URL, e.g. `https://dev.example.com/acme/`.
    pub async fn connect(
        base: &str,
        secrets: Arc<dyn SecretResolver>,
        secret_ref: SecretRef,
    ) -> Result<Self, ApiError> {
        let base = Url::parse(base).map_err(|e| ApiError::Transport(e.to_string()))?;
        let token = secrets.get(&secret_ref).await?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout())
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base,
            token: ArcSwap::from_pointee(token),
            secrets,
            secret_ref,
            api_version: default_api_version(),
        })
    }

    /// Re-resolve the credential and swap it in for subsequent requests.
    pub async fn refresh_token(&self) -> Result<(), ApiError> {
        let token = self.secrets.get(&self.secret_ref).await?;
        self.token.store(Arc::new(token));
        Ok(())
    }

    fn url_for(&self, req: &ApiRequest) -> Result<Url, ApiError> {
        let mut url = self
            .base
            .join(&req.path)
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        {
            let mut q = url.query_pairs_mut();
            for (k, v) in &req.query {
                q.append_pair(k, v);
            }
            q.append_pair("api-version", &self.api_version);
        }
        Ok(url)
    }
}

impl RestClient {
    async fn send(&self, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let t0 = std::time::Instant::now();
        counter!("external_api_calls", 1u64);
        let correlation = Uuid::new_v4();
        let url = self.url_for(req)?;
        debug!(id = %correlation, method = req.method.as_str(), path = %req.path, "external call");

        let method = match req.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let token = self.token.load();
        let mut builder = self
            .http
            .request(method, url)
            .basic_auth("", Some(token.as_str()))
            .header("x-request-id", correlation.to_string());
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            counter!("external_api_errors", 1u64);
            ApiError::Transport(e.to_string())
        })?;
        let status = resp.status().as_u16();
        let continuation = resp
            .headers()
            .get(CONTINUATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let text = resp.text().await.map_err(|e| ApiError::Transport(e.to_string()))?;

        histogram!("external_api_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if !(200..300).contains(&status) {
            counter!("external_api_errors", 1u64);
            warn!(id = %correlation, status, path = %req.path, "external call failed");
            return Err(ApiError::from_status(status, &req.path, text));
        }

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?
        };
        Ok(ApiResponse { status, body, continuation })
    }
}

#[async_trait::async_trait]
impl ApiClient for RestClient {
    async fn execute(&self, req: ApiRequest) -> Result<ApiResponse, ApiError> {
        match self.send(&req).await {
            Err(ApiError::Auth { status }) => {
                warn!(status, path = %req.path, "auth rejected; refreshing credential");
                self.refresh_token().await?;
                self.send(&req).await
            }
            other => other,
        }
    }
}

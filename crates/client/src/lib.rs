//! Steward client: the abstract external API surface and its REST implementation.
//!
//! The reconcile engine only ever sees [`ApiClient`]: one typed request in,
//! one decoded response or a classified error out. Everything HTTP-specific
//! lives in [`rest`].

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod api;
pub mod page;
pub mod rest;

pub use rest::RestClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// One typed call against the external service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the organization base URL, e.g. `_apis/projects`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::Get, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self { method: Method::Post, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    pub fn patch(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self { method: Method::Patch, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self { method: Method::Delete, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }
}

/// Decoded response. The continuation token travels out-of-band because the
/// service returns it in a response header, not in the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub continuation: Option<String>,
}

impl ApiResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body, continuation: None }
    }

    pub fn decode<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        serde_json::from_value(self.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Classified failure of one external call. Not-found is its own variant so
/// callers can treat it as a state signal rather than a failure.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("auth rejected (status {status})")]
    Auth { status: u16 },
    #[error("remote error (status {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Classify a non-2xx status into an error variant.
    pub fn from_status(status: u16, context: &str, message: String) -> Self {
        match status {
            404 => ApiError::NotFound(context.to_string()),
            401 | 403 => ApiError::Auth { status },
            _ => ApiError::Remote { status, message },
        }
    }
}

/// The one capability the reconcile core consumes from the transport layer.
#[async_trait::async_trait]
pub trait ApiClient: Send + Sync {
    async fn execute(&self, req: ApiRequest) -> Result<ApiResponse, ApiError>;
}

/// Indirect pointer to credential material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
}

/// Resolves a credential reference to an opaque bearer/basic token.
#[async_trait::async_trait]
pub trait SecretResolver: Send + Sync {
    async fn get(&self, secret: &SecretRef) -> Result<String, ApiError>;
}

/// Default resolver: the secret name is an environment variable.
pub struct EnvSecretResolver;

#[async_trait::async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn get(&self, secret: &SecretRef) -> Result<String, ApiError> {
        std::env::var(&secret.name)
            .map_err(|_| ApiError::Auth { status: 401 })
    }
}

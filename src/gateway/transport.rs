//! Wire access for [`super::RequestGateway`].

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use url::Url;

use crate::api::{ErrorBody, ErrorCode, ErrorEnvelope};
use crate::session::TokenPair;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("invalid request path: {0}")]
    InvalidPath(String),
    /// The server answered with an error status.
    #[error("server rejected request with {status}: {code:?}")]
    Rejected {
        status: StatusCode,
        code: Option<ErrorCode>,
    },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Network(e.to_string())
    }
}

/// An outbound API call, replayable after a token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, e.g. `auth/me`
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    /// The error envelope, if the body is one.
    pub fn error(&self) -> Option<ErrorBody> {
        self.json::<ErrorEnvelope>().ok().map(|envelope| envelope.error)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error().map(|body| body.code)
    }
}

/// How the gateway reaches the server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request`, attaching `access_token` as a bearer token when present.
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError>;

    /// Exchange a refresh token for a new pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TransportError>;
}

/// [`Transport`] over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    /// `base` is the API root; `auth/login` is resolved against it.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: reqwest::Client, mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidPath(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path)?);
        if let Some(token) = access_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TransportError> {
        let request = ApiRequest::post("auth/refresh", json!({ "refreshToken": refresh_token }));
        let response = self.send(&request, None).await?;

        if !response.status.is_success() {
            return Err(TransportError::Rejected {
                status: response.status,
                code: response.error_code(),
            });
        }
        response
            .json::<TokenPair>()
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

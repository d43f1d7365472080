use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use shared::error::ApiError;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid homeserver url '{url}': {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build http client: {0}")]
    Setup(#[source] reqwest::Error),
    #[error("{method} {path} failed: {source}")]
    Request {
        method: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} {path} timed out")]
    Timeout { method: &'static str, path: String },
    #[error("{method} {path} returned a non-JSON body: {source}")]
    Body {
        method: &'static str,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Non-2xx statuses are data, not errors; callers decide how to degrade.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn api_error(&self) -> Option<ApiError> {
        ApiError::from_body(&self.body)
    }
}

/// Authenticated request/response against the homeserver API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        bearer: &str,
    ) -> Result<HttpResponse, TransportError>;

    async fn put(
        &self,
        path: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<HttpResponse, TransportError>;

    async fn post(
        &self,
        path: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(homeserver: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base = Url::parse(homeserver).map_err(|source| TransportError::BaseUrl {
            url: homeserver.to_string(),
            source,
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TransportError::Setup)?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base
            .join(path)
            .map_err(|source| TransportError::BaseUrl {
                url: format!("{}{path}", self.base),
                source,
            })
    }

    fn request_error(method: &'static str, path: &str, source: reqwest::Error) -> TransportError {
        if source.is_timeout() {
            TransportError::Timeout {
                method,
                path: path.to_string(),
            }
        } else {
            TransportError::Request {
                method,
                path: path.to_string(),
                source,
            }
        }
    }

    async fn into_response(
        method: &'static str,
        path: &str,
        response: reqwest::Response,
    ) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| Self::request_error(method, path, source))?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).map_err(|source| TransportError::Body {
                method,
                path: path.to_string(),
                source,
            })?
        };
        Ok(HttpResponse { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
        bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .http
            .get(self.endpoint(path)?)
            .query(query)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|source| Self::request_error("GET", path, source))?;
        Self::into_response("GET", path, response).await
    }

    async fn put(
        &self,
        path: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .http
            .put(self.endpoint(path)?)
            .json(body)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|source| Self::request_error("PUT", path, source))?;
        Self::into_response("PUT", path, response).await
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        bearer: &str,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(body)
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|source| Self::request_error("POST", path, source))?;
        Self::into_response("POST", path, response).await
    }
}

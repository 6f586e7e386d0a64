//! Network transport: sends one HTTP request and classifies the outcome.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, Method};

/// A fully resolved request, headers included.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request. Transport failures map to `ApiError::Network` or
    /// `ApiError::Timeout`, non-2xx responses to `ApiError::Http`.
    async fn send(&self, request: &HttpRequest) -> Result<Value, ApiError>;
}

/// `Transport` over reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Relative paths are joined onto the base URL; absolute URLs pass through.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    fn headers(request: &HttpRequest) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::Validation(format!("Invalid header name '{}': {}", name, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| ApiError::Validation(format!("Invalid header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<Value, ApiError> {
        let url = self.resolve(&request.url);
        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method.to_reqwest(), &url)
            .headers(Self::headers(request)?);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::from_reqwest(e, self.timeout_secs))?;

        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("{} from {}", e, url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_joins_base_url() {
        let transport =
            ReqwestTransport::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.resolve("/meals"), "https://api.example.com/meals");
        assert_eq!(transport.resolve("meals"), "https://api.example.com/meals");
        assert_eq!(
            transport.resolve("http://other.example.com/x"),
            "http://other.example.com/x"
        );
    }

    #[test]
    fn test_invalid_header_is_validation_error() {
        let mut request = HttpRequest::new(Method::Get, "/meals");
        request.headers.insert("bad header".into(), "v".into());
        assert!(matches!(
            ReqwestTransport::headers(&request),
            Err(ApiError::Validation(_))
        ));
    }
}

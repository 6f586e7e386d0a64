use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApiError;

/// Error string returned to callers when a write was queued instead of sent.
pub const QUEUED_OFFLINE: &str = "queued-offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Method::Get)
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(ApiError::Validation(format!("Unsupported method: {}", other))),
        }
    }
}

/// Per-call behaviour switches for `Dispatcher::dispatch`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Serve reads from, and store them in, the response cache.
    pub cache: bool,
    /// Cache key; the URL is used when absent.
    pub cache_key: Option<String>,
    /// Queue mutating calls that fail for lack of connectivity.
    pub offline_fallback: bool,
    /// Extra headers, persisted with queued entries.
    pub headers: BTreeMap<String, String>,
    /// Top-level body fields that must be present and non-null.
    pub required_fields: Vec<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached() -> Self {
        Self {
            cache: true,
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self {
            offline_fallback: true,
            ..Self::default()
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache = true;
        self.cache_key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn require<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub(crate) fn effective_cache_key<'a>(&'a self, url: &'a str) -> &'a str {
        self.cache_key.as_deref().unwrap_or(url)
    }
}

/// How a dispatched request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Fresh(Value),
    Cached(Value),
    Queued { id: String },
}

impl Dispatched {
    pub fn into_data(self) -> Option<Value> {
        match self {
            Dispatched::Fresh(v) | Dispatched::Cached(v) => Some(v),
            Dispatched::Queued { .. } => None,
        }
    }
}

/// Flat result shape handed to UI callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ApiResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_id: Option<String>,
}

impl ApiResult {
    /// A queued write: not a success yet, but not a failure either.
    pub fn is_queued(&self) -> bool {
        !self.success && self.error.as_deref() == Some(QUEUED_OFFLINE)
    }
}

impl From<Result<Dispatched, ApiError>> for ApiResult {
    fn from(result: Result<Dispatched, ApiError>) -> Self {
        match result {
            Ok(Dispatched::Fresh(data)) | Ok(Dispatched::Cached(data)) => ApiResult {
                success: true,
                data: Some(data),
                error: None,
                queued_id: None,
            },
            Ok(Dispatched::Queued { id }) => ApiResult {
                success: false,
                data: None,
                error: Some(QUEUED_OFFLINE.to_string()),
                queued_id: Some(id),
            },
            Err(e) => ApiResult {
                success: false,
                data: None,
                error: Some(e.to_string()),
                queued_id: None,
            },
        }
    }
}

use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by the API access layer.
///
/// `Clone` so that every waiter on a shared in-flight request receives the
/// same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dropped after {attempts} failed attempts: {method} {url}")]
    QueueCapacityExceeded {
        id: String,
        method: String,
        url: String,
        attempts: u32,
    },

    #[error("Request cancelled")]
    Cancelled,
}

/// Coarse classification, recorded in retry state and status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Network,
    Http,
    Storage,
    QueueCapacityExceeded,
    Cancelled,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        let message = match status {
            401 => "Unauthorized - token may be expired".to_string(),
            403 => format!("Access denied: {}", truncated),
            404 => format!("Resource not found: {}", truncated),
            429 => "Rate limited - please wait before retrying".to_string(),
            500..=599 => format!("Server error: {}", truncated),
            _ => truncated,
        };
        ApiError::Http { status, message }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(timeout_secs)
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            ApiError::Validation(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::Network(_) | ApiError::Timeout(_) => ErrorKind::Network,
            ApiError::Http { .. } | ApiError::InvalidResponse(_) => ErrorKind::Http,
            ApiError::Storage(_) => ErrorKind::Storage,
            ApiError::QueueCapacityExceeded { .. } => ErrorKind::QueueCapacityExceeded,
            ApiError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when the failure means the server could not be reached.
    pub fn is_connectivity(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Only connectivity failures are worth retrying; the server explicitly
    /// rejected everything else.
    pub fn is_retryable(&self) -> bool {
        self.is_connectivity()
    }
}

//! Structured API error classification
//!
//! Outbound HTTP failures are folded into `ApiError` so the retry layer can
//! decide what is worth retrying and the orchestrator can log a useful kind
//! instead of a bare status code.

use std::fmt;

/// Classified failure from an outbound API call
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 429 from the venue, with the advertised wait if present
    RateLimited { retry_after_seconds: Option<u64> },
    /// Request deadline elapsed
    Timeout,
    /// Connection-level failure (DNS, reset, TLS)
    Network(String),
    /// Non-success HTTP status
    Http { status: u16, body: String },
    /// Body arrived but could not be decoded
    Decode(String),
}

impl ApiError {
    /// Whether the retry layer should try again.
    ///
    /// Client errors (4xx other than 429) are not retryable; the request
    /// will not get better.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } | ApiError::Timeout | ApiError::Network(_) => true,
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Decode(_) => false,
        }
    }

    /// Fold a reqwest error into a classified kind.
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_connect() {
            ApiError::Network("connection failed".to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }

    /// Classify a non-success response.
    pub fn from_response(status: u16, body: &str, retry_after: Option<u64>) -> Self {
        if status == 429 {
            return ApiError::RateLimited {
                retry_after_seconds: retry_after,
            };
        }
        ApiError::Http {
            status,
            body: body.chars().take(200).collect(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::RateLimited {
                retry_after_seconds,
            } => match retry_after_seconds {
                Some(seconds) => write!(f, "rate limited (retry after {}s)", seconds),
                None => write!(f, "rate limited"),
            },
            ApiError::Timeout => write!(f, "request timed out"),
            ApiError::Network(msg) => write!(f, "network error: {}", msg),
            ApiError::Http { status, body } => write!(f, "http {}: {}", status, body),
            ApiError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

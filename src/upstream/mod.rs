//! Access to the rate-limited upstream API.
//!
//! All calls go through [`RateLimitedClient`], which owns the budget state
//! and serializes dispatch. The wire is abstracted behind [`Transport`] so the
//! limiter can be driven by a scripted transport and a [`ManualClock`] in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

mod client;
mod clock;
mod http;
mod rate_limit;

pub use client::{LimiterSettings, RateLimitedClient};
pub use clock::{Clock, ManualClock, TokioClock};
pub use http::HttpTransport;
pub use rate_limit::{
    RateLimitState, ERROR_LIMIT_REMAIN_HEADER, ERROR_LIMIT_RESET_HEADER, RATE_LIMIT_REMAINING_HEADER,
    RATE_LIMIT_RESET_HEADER, RETRY_AFTER_HEADER,
};

/// Result type for upstream calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Errors surfaced to callers of the upstream API.
///
/// Throttling never appears here: the limiter absorbs it by sleeping and
/// retrying the same request.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The entity does not exist upstream and never will.
    #[error("Not found: {path}")]
    NotFound { path: String },

    /// Timeouts, connection resets, 5xx. Worth retrying later.
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    /// A 4xx other than 404: the request itself is wrong.
    #[error("Upstream rejected {path} with status {status}")]
    Rejected { path: String, status: u16 },

    /// The payload did not have the expected shape.
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },

    /// The limiter task is gone (process shutting down).
    #[error("Rate limiter stopped")]
    Closed,
}

impl UpstreamError {
    /// Whether retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_) | UpstreamError::Closed)
    }
}

/// A GET request against the upstream API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Path relative to the configured base URL, e.g. `/alliances/99/`.
    pub path: String,
    /// Query string parameters.
    pub query: Vec<(String, String)>,
}

impl UpstreamRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// A raw upstream response. Header names are lowercase.
#[derive(Debug, Clone, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| UpstreamError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Wire-level access to the upstream. One call, one HTTP exchange.
///
/// Implementations return every HTTP response (including 4xx/5xx) as `Ok`;
/// only failures to get a response at all are `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse>;
}

//! Upstream API and rate limiter configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default pause after every dispatched request.
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 100;
/// Error budget at or below which the limiter waits for the reset.
pub const DEFAULT_ERROR_LIMIT_THRESHOLD: i64 = 10;
/// Error budget the upstream grants per window.
pub const DEFAULT_ERROR_LIMIT_CEILING: i64 = 100;
/// Soft request budget per window.
pub const DEFAULT_REQUEST_CEILING: i64 = 150;

/// Upstream API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL all request paths are joined to.
    pub base_url: String,
    /// User-Agent sent with every request.
    pub user_agent: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Pause after every dispatched request, in milliseconds.
    pub inter_request_delay_ms: u64,
    /// Error budget at or below which dispatch waits for the reset.
    pub error_limit_threshold: i64,
    /// Error budget assumed after a reset.
    pub error_limit_ceiling: i64,
    /// Request budget assumed after a reset.
    pub request_ceiling: i64,
    /// Fallback throttle pause when the upstream sends no duration at all.
    pub throttle_fallback_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://esi.evetech.net/latest".to_string(),
            user_agent: concat!("killfeed/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
            error_limit_threshold: DEFAULT_ERROR_LIMIT_THRESHOLD,
            error_limit_ceiling: DEFAULT_ERROR_LIMIT_CEILING,
            request_ceiling: DEFAULT_REQUEST_CEILING,
            throttle_fallback_secs: 1,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

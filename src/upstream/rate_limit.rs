//! Budget state tracked from upstream response headers.
//!
//! The upstream maintains two budgets per window:
//! - a soft request budget (`x-ratelimit-remaining` / `x-ratelimit-reset`)
//! - a hard error budget, decremented by the upstream for every 4xx/5xx
//!   (`x-esi-error-limit-remain` / `x-esi-error-limit-reset`)
//!
//! Exhausting the error budget gets the client banned for the rest of the
//! window, so dispatch stops at a threshold above zero.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Error budget remaining in the current window.
pub const ERROR_LIMIT_REMAIN_HEADER: &str = "x-esi-error-limit-remain";
/// Seconds until the error budget window resets.
pub const ERROR_LIMIT_RESET_HEADER: &str = "x-esi-error-limit-reset";
/// Request budget remaining in the current window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Seconds until the request budget window resets.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
/// Seconds to wait after a hard throttle.
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Status codes the upstream uses for a hard throttle.
const THROTTLE_STATUSES: [u16; 2] = [420, 429];

/// Budget state. Owned by the limiter's scheduler task only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining_requests: i64,
    pub reset_time: Option<Instant>,
    pub error_limit_remaining: i64,
    pub error_reset_time: Option<Instant>,
}

impl RateLimitState {
    /// Fresh state with both budgets at their ceilings and no known reset.
    pub fn new(request_ceiling: i64, error_ceiling: i64) -> Self {
        Self {
            remaining_requests: request_ceiling,
            reset_time: None,
            error_limit_remaining: error_ceiling,
            error_reset_time: None,
        }
    }

    /// Deadline to wait for before dispatching, if the error budget is at
    /// or below `threshold` and its reset is known.
    pub fn error_pause_until(&self, threshold: i64) -> Option<Instant> {
        if self.error_limit_remaining <= threshold {
            self.error_reset_time
        } else {
            None
        }
    }

    /// Deadline to wait for if the request budget is spent.
    pub fn request_pause_until(&self) -> Option<Instant> {
        if self.remaining_requests <= 0 {
            self.reset_time
        } else {
            None
        }
    }

    /// Restore the error budget after its window reset.
    pub fn reset_errors(&mut self, ceiling: i64) {
        self.error_limit_remaining = ceiling;
        self.error_reset_time = None;
    }

    /// Restore the request budget after its window reset.
    pub fn reset_requests(&mut self, ceiling: i64) {
        self.remaining_requests = ceiling;
        self.reset_time = None;
    }

    /// Optimistic bookkeeping for a request about to be sent.
    ///
    /// The next response's headers overwrite both values.
    pub fn on_dispatch(&mut self) {
        self.remaining_requests = self.remaining_requests.saturating_sub(1);
        self.error_limit_remaining = self.error_limit_remaining.saturating_sub(1);
    }

    /// Overwrite state from response headers. Absent or unparsable headers
    /// leave the corresponding field untouched.
    pub fn apply_headers(&mut self, headers: &HashMap<String, String>, now: Instant) {
        if let Some(remain) = parse_int(headers, ERROR_LIMIT_REMAIN_HEADER) {
            self.error_limit_remaining = remain;
        }
        if let Some(reset) = parse_seconds(headers, ERROR_LIMIT_RESET_HEADER) {
            self.error_reset_time = Some(now + reset);
        }
        if let Some(remain) = parse_int(headers, RATE_LIMIT_REMAINING_HEADER) {
            self.remaining_requests = remain;
        }
        if let Some(reset) = parse_seconds(headers, RATE_LIMIT_RESET_HEADER) {
            self.reset_time = Some(now + reset);
        }
    }
}

/// Whether a status is the upstream's hard throttle.
pub fn is_throttle(status: u16) -> bool {
    THROTTLE_STATUSES.contains(&status)
}

/// Server-given pause for a throttled response: `retry-after`, falling back
/// to the error-budget reset.
pub fn throttle_pause(headers: &HashMap<String, String>) -> Option<Duration> {
    parse_seconds(headers, RETRY_AFTER_HEADER)
        .or_else(|| parse_seconds(headers, ERROR_LIMIT_RESET_HEADER))
}

fn parse_int(headers: &HashMap<String, String>, name: &str) -> Option<i64> {
    headers.get(name).and_then(|v| v.trim().parse().ok())
}

fn parse_seconds(headers: &HashMap<String, String>, name: &str) -> Option<Duration> {
    parse_int(headers, name)
        .filter(|secs| *secs >= 0)
        .map(|secs| Duration::from_secs(secs as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_headers_overwrite_local_estimates() {
        let now = Instant::now();
        let mut state = RateLimitState::new(150, 100);
        state.on_dispatch();
        assert_eq!(state.error_limit_remaining, 99);

        state.apply_headers(
            &headers(&[
                (ERROR_LIMIT_REMAIN_HEADER, "42"),
                (ERROR_LIMIT_RESET_HEADER, "17"),
                (RATE_LIMIT_REMAINING_HEADER, "120"),
                (RATE_LIMIT_RESET_HEADER, "3"),
            ]),
            now,
        );

        assert_eq!(state.error_limit_remaining, 42);
        assert_eq!(state.error_reset_time, Some(now + Duration::from_secs(17)));
        assert_eq!(state.remaining_requests, 120);
        assert_eq!(state.reset_time, Some(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_absent_headers_are_not_zero() {
        let now = Instant::now();
        let mut state = RateLimitState::new(150, 100);
        let before = state.clone();

        state.apply_headers(&HashMap::new(), now);
        assert_eq!(state, before);

        state.apply_headers(&headers(&[(ERROR_LIMIT_REMAIN_HEADER, "garbage")]), now);
        assert_eq!(state, before);
    }

    #[test]
    fn test_error_pause_requires_known_reset() {
        let now = Instant::now();
        let mut state = RateLimitState::new(150, 100);
        state.error_limit_remaining = 5;
        assert_eq!(state.error_pause_until(10), None);

        state.error_reset_time = Some(now + Duration::from_secs(30));
        assert_eq!(state.error_pause_until(10), state.error_reset_time);
        assert_eq!(state.error_pause_until(4), None);
    }

    #[test]
    fn test_reset_restores_ceiling() {
        let mut state = RateLimitState::new(150, 100);
        state.error_limit_remaining = 2;
        state.error_reset_time = Some(Instant::now());
        state.reset_errors(100);
        assert_eq!(state.error_limit_remaining, 100);
        assert!(state.error_reset_time.is_none());
    }

    #[test]
    fn test_throttle_detection_and_pause() {
        assert!(is_throttle(420));
        assert!(is_throttle(429));
        assert!(!is_throttle(503));

        assert_eq!(
            throttle_pause(&headers(&[(RETRY_AFTER_HEADER, "7"), (ERROR_LIMIT_RESET_HEADER, "50")])),
            Some(Duration::from_secs(7))
        );
        assert_eq!(
            throttle_pause(&headers(&[(ERROR_LIMIT_RESET_HEADER, "50")])),
            Some(Duration::from_secs(50))
        );
        assert_eq!(throttle_pause(&HashMap::new()), None);
    }
}

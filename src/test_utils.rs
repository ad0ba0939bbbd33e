//! Test utilities: a path-routed fake upstream.
//!
//! Available to unit tests and, with the `test-utils` feature, to the
//! integration tests under `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::upstream::{
    LimiterSettings, RateLimitedClient, Result, TokioClock, Transport, UpstreamRequest,
    UpstreamResponse,
};

/// Fake upstream answering by request path.
///
/// Each path holds a queue of responses; the last one repeats. Paths with
/// no responses answer 404.
#[derive(Default)]
pub struct RoutedTransport {
    routes: Mutex<HashMap<String, VecDeque<UpstreamResponse>>>,
    requests: Mutex<Vec<String>>,
}

impl RoutedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a response for `path`.
    pub fn respond(&self, path: &str, response: UpstreamResponse) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(path.to_string())
            .or_default()
            .push_back(response);
    }

    /// Queue a 200 response with a JSON body for `path`.
    pub fn respond_json(&self, path: &str, body: serde_json::Value) {
        self.respond(
            path,
            UpstreamResponse::new(200).with_body(body.to_string()),
        );
    }

    /// Every requested path, in dispatch order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many times `path` was requested.
    pub fn request_count(&self, path: &str) -> usize {
        self.requests().iter().filter(|p| *p == path).count()
    }
}

#[async_trait]
impl Transport for RoutedTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.path.clone());

        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let response = match routes.get_mut(&request.path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| UpstreamResponse::new(404)))
    }
}

/// A limiter over `transport` with no inter-request delay.
pub fn test_client(transport: Arc<dyn Transport>) -> RateLimitedClient {
    let settings = LimiterSettings {
        inter_request_delay: Duration::ZERO,
        ..LimiterSettings::default()
    };
    RateLimitedClient::spawn(transport, settings, Arc::new(TokioClock))
}

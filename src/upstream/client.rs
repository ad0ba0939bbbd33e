//! The rate-limited client: one scheduler task, many callers.
//!
//! ## Architecture
//! ```text
//! [worker task] --request--> [mpsc] --> [scheduler task] --> Transport
//! [worker task] --request-->    |             |
//!                               |      RateLimitState (owned here only)
//!        <------------------- oneshot reply --+
//! ```
//!
//! Callers only hold a cheap cloneable handle. Dispatch is strictly serial,
//! so worker prefetch raises pipeline parallelism (parsing, upserts) without
//! raising the upstream request rate.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument};

use super::clock::{Clock, TokioClock};
use super::http::HttpTransport;
use super::rate_limit::{is_throttle, throttle_pause, RateLimitState};
use super::{Result, Transport, UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::config::UpstreamConfig;

/// Limiter tuning.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Dispatch waits for the error reset at or below this budget.
    pub error_limit_threshold: i64,
    /// Error budget assumed once the window resets.
    pub error_limit_ceiling: i64,
    /// Request budget assumed once the window resets.
    pub request_ceiling: i64,
    /// Pause after every dispatched request.
    pub inter_request_delay: Duration,
    /// Throttle pause when the upstream gives no duration at all.
    pub throttle_fallback: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self::from(&UpstreamConfig::default())
    }
}

impl From<&UpstreamConfig> for LimiterSettings {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            error_limit_threshold: config.error_limit_threshold,
            error_limit_ceiling: config.error_limit_ceiling,
            request_ceiling: config.request_ceiling,
            inter_request_delay: config.inter_request_delay(),
            throttle_fallback: Duration::from_secs(config.throttle_fallback_secs),
        }
    }
}

struct Job {
    request: UpstreamRequest,
    reply: oneshot::Sender<Result<UpstreamResponse>>,
}

/// Handle to the limiter. Clone freely; all clones share one scheduler.
///
/// The scheduler task exits once every handle is dropped.
#[derive(Clone)]
pub struct RateLimitedClient {
    jobs: mpsc::UnboundedSender<Job>,
}

impl RateLimitedClient {
    /// Start the scheduler task and return a handle to it.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        settings: LimiterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            state: RateLimitState::new(settings.request_ceiling, settings.error_limit_ceiling),
            transport,
            settings,
            clock,
            pending: VecDeque::new(),
            rx,
        };
        tokio::spawn(scheduler.run());
        Self { jobs }
    }

    /// Start a limiter over HTTP with wall-clock time.
    pub fn connect(config: &UpstreamConfig) -> Result<Self> {
        let transport = HttpTransport::new(config)?;
        info!(base_url = %config.base_url, "Upstream client started");
        Ok(Self::spawn(
            Arc::new(transport),
            LimiterSettings::from(config),
            Arc::new(TokioClock),
        ))
    }

    /// Queue a request and wait for its response.
    ///
    /// Returns only 2xx responses; 404 becomes [`UpstreamError::NotFound`],
    /// other 4xx [`UpstreamError::Rejected`], 5xx [`UpstreamError::Transient`].
    pub async fn request(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .map_err(|_| UpstreamError::Closed)?;
        rx.await.map_err(|_| UpstreamError::Closed)?
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.request(UpstreamRequest::get(path)).await?;
        response.json(path)
    }
}

struct Scheduler {
    state: RateLimitState,
    transport: Arc<dyn Transport>,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    pending: VecDeque<Job>,
    rx: mpsc::UnboundedReceiver<Job>,
}

impl Scheduler {
    async fn run(mut self) {
        loop {
            if self.pending.is_empty() {
                match self.rx.recv().await {
                    Some(job) => self.pending.push_back(job),
                    None => break,
                }
            }
            while let Ok(job) = self.rx.try_recv() {
                self.pending.push_back(job);
            }

            let Some(job) = self.pending.pop_front() else {
                continue;
            };
            if job.reply.is_closed() {
                // Caller went away; don't spend budget on it.
                continue;
            }

            self.wait_for_budget().await;

            let span = tracing::debug_span!("upstream.request", path = %job.request.path);
            self.state.on_dispatch();
            let outcome = self.transport.send(&job.request).instrument(span).await;

            match outcome {
                Ok(response) => {
                    self.state.apply_headers(&response.headers, self.clock.now());

                    if is_throttle(response.status) {
                        let pause = throttle_pause(&response.headers)
                            .unwrap_or(self.settings.throttle_fallback);
                        warn!(
                            path = %job.request.path,
                            status = response.status,
                            pause_secs = pause.as_secs(),
                            "Upstream throttled, retrying after pause"
                        );
                        self.clock.sleep(pause).await;
                        self.pending.push_front(job);
                        continue;
                    }

                    let _ = job.reply.send(classify(&job.request.path, response));
                }
                Err(e) => {
                    let _ = job.reply.send(Err(e));
                }
            }

            self.clock.sleep(self.settings.inter_request_delay).await;
        }

        debug!("Rate limiter scheduler stopped");
    }

    /// Sleep until both budgets allow another dispatch.
    async fn wait_for_budget(&mut self) {
        if let Some(deadline) = self
            .state
            .error_pause_until(self.settings.error_limit_threshold)
        {
            let now = self.clock.now();
            if deadline > now {
                info!(
                    remaining = self.state.error_limit_remaining,
                    wait_secs = (deadline - now).as_secs(),
                    "Error budget low, waiting for reset"
                );
            }
            self.clock.sleep_until(deadline).await;
            self.state.reset_errors(self.settings.error_limit_ceiling);
        }

        if let Some(deadline) = self.state.request_pause_until() {
            debug!("Request budget spent, waiting for reset");
            self.clock.sleep_until(deadline).await;
            self.state.reset_requests(self.settings.request_ceiling);
        }
    }
}

fn classify(path: &str, response: UpstreamResponse) -> Result<UpstreamResponse> {
    match response.status {
        s if (200..300).contains(&s) => Ok(response),
        404 => Err(UpstreamError::NotFound {
            path: path.to_string(),
        }),
        s if (400..500).contains(&s) => Err(UpstreamError::Rejected {
            path: path.to_string(),
            status: s,
        }),
        s => Err(UpstreamError::Transient(format!(
            "{} returned status {}",
            path, s
        ))),
    }
}

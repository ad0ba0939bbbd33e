//! Worker and orchestrator configuration.

use std::time::Duration;

use serde::Deserialize;

/// Worker runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unacknowledged deliveries a worker may hold at once.
    pub prefetch: u16,
    /// Deliveries after which a transient failure is dead-lettered.
    ///
    /// `None` keeps requeueing forever; poison messages must then be purged
    /// by an operator.
    pub max_attempts: Option<u32>,
    /// Loss records valued per batch when draining the backlog directly.
    pub value_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            max_attempts: None,
            value_batch_size: 200,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Seconds between drain polls.
    pub poll_interval_secs: u64,
    /// UTC hour at which scheduled runs start.
    pub run_hour_utc: u32,
    /// Stage timeouts, in minutes.
    pub timeouts: StageTimeouts,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            run_hour_utc: 11,
            timeouts: StageTimeouts::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Per-stage drain timeouts, in minutes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub organizations: u64,
    pub discovery: u64,
    pub suborganizations: u64,
    pub values: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            organizations: 60,
            discovery: 60,
            suborganizations: 180,
            values: 60,
        }
    }
}

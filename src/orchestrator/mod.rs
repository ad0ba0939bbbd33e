//! Daily workflow orchestration.
//!
//! A run executes a fixed, ordered list of [`WorkflowStage`]s. Each stage
//! runs its action, then polls its watch queue until it reads empty:
//!
//! ```text
//! Running(0) --action--> drain(queue 0) --empty--> Running(1) --> ... --> Succeeded
//!                             |
//!                             +--timeout / action error--> Failed(0)   (remaining stages skipped)
//! ```
//!
//! There is no partial resume: the next run starts over at stage 0. Every
//! downstream step is idempotent, so repeating finished stages is safe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BusError, QueueBroker, QueueOptions};
use crate::message::Queue;
use crate::storage::StorageError;
use crate::upstream::UpstreamError;

pub mod actions;

pub use actions::{
    default_stages, EnumerateOrganizations, PublishStoredOrganizations, RefreshPricesAndBacklog,
    WaitOnly,
};

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The watch queue did not empty in time.
    #[error("Queue {queue} still held {remaining} messages after {timeout:?}")]
    DrainTimeout {
        queue: String,
        remaining: u32,
        timeout: Duration,
    },
}

/// What a stage does before waiting for its queue.
#[async_trait]
pub trait StageAction: Send + Sync {
    /// Run the action; returns how many items it queued.
    async fn run(&self) -> Result<usize>;
}

/// One step of the workflow.
#[derive(Clone)]
pub struct WorkflowStage {
    pub name: String,
    pub action: Arc<dyn StageAction>,
    /// Queue that must drain before the next stage starts.
    pub watch_queue: Queue,
    pub timeout: Duration,
}

impl WorkflowStage {
    pub fn new(
        name: impl Into<String>,
        action: Arc<dyn StageAction>,
        watch_queue: Queue,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            action,
            watch_queue,
            timeout,
        }
    }
}

/// Observable state of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running(usize),
    Succeeded,
    Failed(usize),
    Cancelled,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    Succeeded,
    Failed {
        stage: usize,
        name: String,
        error: OrchestratorError,
    },
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

enum Drain {
    Drained,
    Cancelled,
}

/// Sequences stages and waits for queue drainage between them.
pub struct Orchestrator {
    broker: Arc<dyn QueueBroker>,
    stages: Vec<WorkflowStage>,
    poll_interval: Duration,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        stages: Vec<WorkflowStage>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            broker,
            stages,
            poll_interval,
            state,
        }
    }

    pub fn stages(&self) -> &[WorkflowStage] {
        &self.stages
    }

    /// Follow run state changes.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Run every stage once, in order.
    pub async fn run_once(&self, cancel: &CancellationToken) -> RunOutcome {
        let started = Instant::now();
        info!(stages = self.stages.len(), "Workflow run started");

        for (index, stage) in self.stages.iter().enumerate() {
            self.state.send_replace(RunState::Running(index));
            let span = info_span!(
                "orchestrator.stage",
                stage = %stage.name,
                index,
                queue = %stage.watch_queue
            );

            #[cfg(feature = "otel")]
            let stage_started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(Drain::Cancelled),
                result = self.run_stage(stage, cancel).instrument(span) => result,
            };
            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{outcome_attr, stage_attr, STAGE_DURATION};
                let outcome = match &result {
                    Ok(Drain::Drained) => "drained",
                    Ok(Drain::Cancelled) => "cancelled",
                    Err(_) => "failed",
                };
                STAGE_DURATION.record(
                    stage_started.elapsed().as_secs_f64(),
                    &[stage_attr(&stage.name), outcome_attr(outcome)],
                );
            }

            match result {
                Ok(Drain::Drained) => {}
                Ok(Drain::Cancelled) => {
                    warn!(stage = %stage.name, "Workflow run cancelled");
                    self.state.send_replace(RunState::Cancelled);
                    return RunOutcome::Cancelled;
                }
                Err(error) => {
                    error!(stage = %stage.name, index, error = %error, "Workflow run failed");
                    self.state.send_replace(RunState::Failed(index));
                    return RunOutcome::Failed {
                        stage: index,
                        name: stage.name.clone(),
                        error,
                    };
                }
            }
        }

        info!(
            elapsed_secs = started.elapsed().as_secs(),
            "Workflow run succeeded"
        );
        self.state.send_replace(RunState::Succeeded);
        RunOutcome::Succeeded
    }

    async fn run_stage(&self, stage: &WorkflowStage, cancel: &CancellationToken) -> Result<Drain> {
        self.broker
            .declare(stage.watch_queue.name(), QueueOptions::default())
            .await?;

        let queued = stage.action.run().await?;
        info!(queued, "Stage action finished, waiting for drain");

        self.drain(stage, cancel).await
    }

    /// Poll the watch queue until it is empty or the stage times out.
    async fn drain(&self, stage: &WorkflowStage, cancel: &CancellationToken) -> Result<Drain> {
        let queue = stage.watch_queue.name();
        let deadline = Instant::now() + stage.timeout;

        loop {
            let remaining = match self.broker.stats(queue).await {
                Ok(Some(stats)) => stats.message_count,
                // Nothing declared means nothing to wait for.
                Ok(None) => 0,
                Err(e) => {
                    warn!(queue, error = %e, "Failed to read queue stats");
                    u32::MAX
                }
            };

            if remaining == 0 {
                info!(queue, "Queue drained");
                return Ok(Drain::Drained);
            }
            if Instant::now() >= deadline {
                return Err(OrchestratorError::DrainTimeout {
                    queue: queue.to_string(),
                    remaining,
                    timeout: stage.timeout,
                });
            }
            debug!(queue, remaining, "Waiting for queue to drain");

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Drain::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Run every day at `run_hour_utc` until cancelled.
    pub async fn run_scheduled(&self, run_hour_utc: u32, cancel: &CancellationToken) {
        loop {
            let delay = until_next_run(Utc::now(), run_hour_utc);
            info!(
                run_hour_utc,
                sleep_secs = delay.as_secs(),
                "Next workflow run scheduled"
            );

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if let RunOutcome::Cancelled = self.run_once(cancel).await {
                return;
            }
        }
    }
}

/// Time from `now` until the next `hour`:00 UTC, strictly in the future.
pub fn until_next_run(now: DateTime<Utc>, hour: u32) -> Duration {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        now.date_naive()
            .checked_add_days(Days::new(1))
            .map(|day| day.and_time(at).and_utc())
            .unwrap_or(today)
    };
    (next - now).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests;

use super::*;
use crate::bus::MemoryBroker;
use crate::message::QueueMessage;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const POLL: Duration = Duration::from_secs(30);

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Publishes `count` messages to a queue.
struct Publish {
    broker: MemoryBroker,
    queue: Queue,
    count: i64,
}

#[async_trait]
impl StageAction for Publish {
    async fn run(&self) -> Result<usize> {
        for id in 1..=self.count {
            self.broker
                .publish(self.queue.name(), &QueueMessage::new(id, "test"))
                .await?;
        }
        Ok(self.count as usize)
    }
}

/// Records when it ran and how deep `watched` was at that moment.
struct Observe {
    broker: MemoryBroker,
    watched: Queue,
    started: Instant,
    observed: Mutex<Option<(Duration, u32)>>,
    runs: AtomicUsize,
}

impl Observe {
    fn new(broker: &MemoryBroker, watched: Queue) -> Arc<Self> {
        Arc::new(Self {
            broker: broker.clone(),
            watched,
            started: Instant::now(),
            observed: Mutex::new(None),
            runs: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageAction for Observe {
    async fn run(&self) -> Result<usize> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let depth = self
            .broker
            .stats(self.watched.name())
            .await?
            .map(|s| s.message_count)
            .unwrap_or_default();
        *self.observed.lock().unwrap() = Some((self.started.elapsed(), depth));
        Ok(0)
    }
}

struct Failing;

#[async_trait]
impl StageAction for Failing {
    async fn run(&self) -> Result<usize> {
        Err(UpstreamError::Transient("connection reset".to_string()).into())
    }
}

fn orchestrator(broker: &MemoryBroker, stages: Vec<WorkflowStage>) -> Orchestrator {
    Orchestrator::new(Arc::new(broker.clone()), stages, POLL)
}

fn publish(broker: &MemoryBroker, queue: Queue, count: i64) -> Arc<Publish> {
    Arc::new(Publish {
        broker: broker.clone(),
        queue,
        count,
    })
}

#[tokio::test(start_paused = true)]
async fn test_next_stage_waits_for_drain() {
    let broker = MemoryBroker::new();
    let second = Observe::new(&broker, Queue::Organizations);
    let orchestrator = orchestrator(
        &broker,
        vec![
            WorkflowStage::new(
                "organizations",
                publish(&broker, Queue::Organizations, 2),
                Queue::Organizations,
                minutes(60),
            ),
            WorkflowStage::new("next", second.clone(), Queue::Suborganizations, minutes(60)),
        ],
    );

    // Workers finish the first queue 45s in.
    tokio::spawn({
        let broker = broker.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            broker.purge(Queue::Organizations.name()).await.unwrap();
        }
    });

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;

    assert!(outcome.is_success());
    let observed = *second.observed.lock().unwrap();
    let (elapsed, depth) = observed.expect("second stage never ran");
    assert_eq!(depth, 0);
    assert!(elapsed >= Duration::from_secs(45));
    assert!(elapsed <= Duration::from_secs(45) + POLL);
    assert_eq!(*orchestrator.subscribe().borrow(), RunState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_queue_that_never_drains_fails_the_run() {
    let broker = MemoryBroker::new();
    let second = Observe::new(&broker, Queue::Organizations);
    let orchestrator = orchestrator(
        &broker,
        vec![
            WorkflowStage::new(
                "organizations",
                publish(&broker, Queue::Organizations, 1),
                Queue::Organizations,
                minutes(2),
            ),
            WorkflowStage::new("next", second.clone(), Queue::Suborganizations, minutes(60)),
        ],
    );
    let started = Instant::now();

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;

    match outcome {
        RunOutcome::Failed {
            stage: 0,
            name,
            error: OrchestratorError::DrainTimeout { remaining: 1, .. },
        } => assert_eq!(name, "organizations"),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(started.elapsed() >= minutes(2));
    assert_eq!(second.runs(), 0);
    assert_eq!(*orchestrator.subscribe().borrow(), RunState::Failed(0));
}

#[tokio::test(start_paused = true)]
async fn test_action_error_aborts_remaining_stages() {
    let broker = MemoryBroker::new();
    let second = Observe::new(&broker, Queue::Organizations);
    let orchestrator = orchestrator(
        &broker,
        vec![
            WorkflowStage::new("broken", Arc::new(Failing), Queue::Organizations, minutes(1)),
            WorkflowStage::new("next", second.clone(), Queue::Suborganizations, minutes(1)),
        ],
    );

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;

    assert!(matches!(
        outcome,
        RunOutcome::Failed {
            stage: 0,
            error: OrchestratorError::Upstream(_),
            ..
        }
    ));
    assert_eq!(second.runs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_watch_queue_advances_immediately() {
    let broker = MemoryBroker::new();
    let stages = vec![
        WorkflowStage::new("a", Arc::new(WaitOnly), Queue::Organizations, minutes(1)),
        WorkflowStage::new("b", Arc::new(WaitOnly), Queue::Suborganizations, minutes(1)),
    ];
    let orchestrator = orchestrator(&broker, stages);
    let started = Instant::now();

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;

    assert!(outcome.is_success());
    assert_eq!(started.elapsed(), Duration::ZERO);
    // Watch queues are declared by the run.
    assert!(broker
        .stats(Queue::Suborganizations.name())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_draining() {
    let broker = MemoryBroker::new();
    let orchestrator = orchestrator(
        &broker,
        vec![WorkflowStage::new(
            "organizations",
            publish(&broker, Queue::Organizations, 1),
            Queue::Organizations,
            minutes(60),
        )],
    );
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(100)).await;
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run_once(&cancel).await;

    assert!(matches!(outcome, RunOutcome::Cancelled));
    assert_eq!(*orchestrator.subscribe().borrow(), RunState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_mode_runs_and_stops_on_cancel() {
    let broker = MemoryBroker::new();
    let orchestrator = Arc::new(orchestrator(
        &broker,
        vec![WorkflowStage::new(
            "only",
            Arc::new(WaitOnly),
            Queue::Organizations,
            minutes(1),
        )],
    ));
    let mut state = orchestrator.subscribe();
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run_scheduled(11, &cancel).await }
    });

    state
        .wait_for(|s| *s == RunState::Succeeded)
        .await
        .unwrap();
    cancel.cancel();
    task.await.unwrap();
}

#[test]
fn test_until_next_run() {
    let at = |s: &str| s.parse::<DateTime<Utc>>().unwrap();

    assert_eq!(
        until_next_run(at("2024-05-01T10:00:00Z"), 11),
        Duration::from_secs(3600)
    );
    assert_eq!(
        until_next_run(at("2024-05-01T12:30:00Z"), 11),
        Duration::from_secs(22 * 3600 + 30 * 60)
    );
    assert_eq!(
        until_next_run(at("2024-05-01T11:00:00Z"), 11),
        Duration::from_secs(24 * 3600)
    );
    assert_eq!(
        until_next_run(at("2024-12-31T23:00:00Z"), 0),
        Duration::from_secs(3600)
    );
}

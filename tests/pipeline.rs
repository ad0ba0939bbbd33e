//! End-to-end pipeline tests: in-memory broker, fake upstream, SQLite storage.
//!
//! Run with: cargo test --test pipeline --features test-utils

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use killfeed::bus::{MemoryBroker, QueueBroker, QueueOptions};
use killfeed::config::WorkerConfig;
use killfeed::entity::EntityKind;
use killfeed::loss::{ItemPrice, LossItem, LossRecord};
use killfeed::message::{Mode, Queue, QueueMessage};
use killfeed::orchestrator::{
    EnumerateOrganizations, Orchestrator, OrchestratorError, RunOutcome, WaitOnly, WorkflowStage,
};
use killfeed::storage::{EntityStore, LossStore, PriceStore, Stores};
use killfeed::test_utils::{test_client, RoutedTransport};
use killfeed::workers::{WorkerKind, WorkerRuntime};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

async fn sqlite_stores() -> Stores {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    Stores::sqlite(pool).await.expect("Failed to create schema")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// File-backed stores with several connections, so writes really race.
async fn shared_file_stores(dir: &tempfile::TempDir) -> Stores {
    let path = dir.path().join("killfeed.db");
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .expect("Failed to open SQLite file");
    Stores::sqlite(pool).await.expect("Failed to create schema")
}

/// Spawn a worker of `kind` consuming until `cancel` fires.
fn spawn_worker(
    kind: WorkerKind,
    transport: &Arc<RoutedTransport>,
    broker: &Arc<dyn QueueBroker>,
    stores: &Stores,
    cancel: &CancellationToken,
) -> (Arc<WorkerRuntime>, JoinHandle<()>) {
    spawn_worker_with(kind, transport, broker, stores, cancel, WorkerConfig::default())
}

fn spawn_worker_with(
    kind: WorkerKind,
    transport: &Arc<RoutedTransport>,
    broker: &Arc<dyn QueueBroker>,
    stores: &Stores,
    cancel: &CancellationToken,
    config: WorkerConfig,
) -> (Arc<WorkerRuntime>, JoinHandle<()>) {
    let processor = kind.processor(&test_client(transport.clone()), broker, stores);
    let worker = Arc::new(WorkerRuntime::new(broker.clone(), processor, config));
    let handle = tokio::spawn({
        let worker = worker.clone();
        let cancel = cancel.clone();
        async move {
            worker.run(cancel).await.expect("worker failed");
        }
    });
    (worker, handle)
}

fn organization_body(name: &str, members: i64) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "ticker": "TICK",
        "creator_id": 7,
        "executor_corporation_id": members,
        "date_founded": "2010-06-01T05:36:00Z"
    })
}

#[tokio::test]
async fn test_entity_fetch_skip_then_refresh() {
    let broker = MemoryBroker::new();
    let shared: Arc<dyn QueueBroker> = Arc::new(broker.clone());
    let stores = sqlite_stores().await;
    let transport = RoutedTransport::new();
    transport.respond_json("/alliances/12345/", organization_body("First", 1));
    transport.respond_json("/alliances/12345/", organization_body("Second", 2));
    let cancel = CancellationToken::new();
    let (worker, handle) =
        spawn_worker(WorkerKind::Organization, &transport, &shared, &stores, &cancel);

    let queue = Queue::Organizations.name();
    broker.declare(queue, QueueOptions::default()).await.unwrap();
    broker
        .publish(queue, &QueueMessage::new(12345, "test"))
        .await
        .unwrap();
    eventually(|| async { worker.stats().processed == 1 }).await;
    let first = stores
        .entities
        .find_by_id(EntityKind::Organization, 12345)
        .await
        .unwrap()
        .expect("entity not stored");

    // A plain republish is skipped without an upstream call.
    broker
        .publish(queue, &QueueMessage::new(12345, "test"))
        .await
        .unwrap();
    eventually(|| async { worker.stats().skipped == 1 }).await;
    assert_eq!(transport.request_count("/alliances/12345/"), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    broker
        .publish(
            queue,
            &QueueMessage::new(12345, "test").with_mode(Mode::Refresh),
        )
        .await
        .unwrap();
    eventually(|| async { worker.stats().processed == 2 }).await;

    cancel.cancel();
    handle.await.unwrap();

    let ids = stores
        .entities
        .list_ids(EntityKind::Organization)
        .await
        .unwrap();
    assert_eq!(ids, vec![12345]);
    let second = stores
        .entities
        .find_by_id(EntityKind::Organization, 12345)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.data.name, "Second");
    assert_eq!(second.data.parent_id, Some(2));
    assert!(second.updated_at > first.updated_at);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second.data.founded_at, first.data.founded_at);
    assert_eq!(second.data.creator_id, Some(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refreshes_of_one_id_keep_one_row() {
    let dir = tempfile::tempdir().unwrap();
    let stores = shared_file_stores(&dir).await;
    let broker = MemoryBroker::new();
    let shared: Arc<dyn QueueBroker> = Arc::new(broker.clone());
    let transport = RoutedTransport::new();
    transport.respond_json("/alliances/12345/", organization_body("First", 1));
    transport.respond_json("/alliances/12345/", organization_body("Refreshed", 2));

    let queue = Queue::Organizations.name();
    broker.declare(queue, QueueOptions::default()).await.unwrap();
    broker
        .publish(queue, &QueueMessage::new(12345, "test"))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let config = WorkerConfig {
        prefetch: 4,
        ..WorkerConfig::default()
    };
    let (first_worker, first_handle) = spawn_worker_with(
        WorkerKind::Organization,
        &transport,
        &shared,
        &stores,
        &cancel,
        config.clone(),
    );
    eventually(|| async { first_worker.stats().processed == 1 }).await;
    let created = stores
        .entities
        .find_by_id(EntityKind::Organization, 12345)
        .await
        .unwrap()
        .expect("entity not stored");

    let (second_worker, second_handle) = spawn_worker_with(
        WorkerKind::Organization,
        &transport,
        &shared,
        &stores,
        &cancel,
        config,
    );
    let refreshes = vec![QueueMessage::new(12345, "test").with_mode(Mode::Refresh); 16];
    broker.publish_batch(queue, &refreshes).await.unwrap();
    eventually(|| async {
        first_worker.stats().processed + second_worker.stats().processed == 17
    })
    .await;
    cancel.cancel();
    first_handle.await.unwrap();
    second_handle.await.unwrap();

    for worker in [&first_worker, &second_worker] {
        let stats = worker.stats();
        assert_eq!((stats.failed, stats.dead_lettered), (0, 0));
    }
    assert_eq!(
        stores
            .entities
            .list_ids(EntityKind::Organization)
            .await
            .unwrap(),
        vec![12345]
    );
    let record = stores
        .entities
        .find_by_id(EntityKind::Organization, 12345)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.data.name, "Refreshed");
    assert_eq!(record.created_at, created.created_at);
    assert_eq!(record.data.founded_at, created.data.founded_at);
    assert_eq!(record.data.creator_id, Some(7));
}

#[tokio::test]
async fn test_loss_value_through_worker() {
    let broker = MemoryBroker::new();
    let shared: Arc<dyn QueueBroker> = Arc::new(broker.clone());
    let stores = sqlite_stores().await;
    stores
        .prices
        .upsert_prices(&[
            ItemPrice {
                type_id: 587,
                price: 100.0,
            },
            ItemPrice {
                type_id: 2048,
                price: 50.0,
            },
            ItemPrice {
                type_id: 215,
                price: 30.0,
            },
        ])
        .await
        .unwrap();
    stores
        .losses
        .insert_loss(&LossRecord {
            id: 77,
            ship_type_id: 587,
            items: vec![LossItem::destroyed(2048, 2), LossItem::dropped(215, 1)],
        })
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let (worker, handle) = spawn_worker(
        WorkerKind::Value,
        &RoutedTransport::new(),
        &shared,
        &stores,
        &cancel,
    );

    let queue = Queue::LossValues.name();
    broker.declare(queue, QueueOptions::default()).await.unwrap();
    broker
        .publish(queue, &QueueMessage::new(77, "test"))
        .await
        .unwrap();
    eventually(|| async { worker.stats().processed == 1 }).await;
    cancel.cancel();
    handle.await.unwrap();

    let value = stores.losses.find_value(77).await.unwrap().unwrap();
    assert_eq!(value.destroyed(), 200.00);
    assert_eq!(value.dropped(), 30.00);
    assert_eq!(value.total(), 230.00);
    assert!(stores.losses.unvalued_loss_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_orchestrator_advances_once_workers_drain() {
    let broker = MemoryBroker::new();
    let shared: Arc<dyn QueueBroker> = Arc::new(broker.clone());
    let stores = sqlite_stores().await;
    let transport = RoutedTransport::new();
    transport.respond_json("/alliances/", serde_json::json!([1, 2, 3]));
    for id in 1..=3 {
        transport.respond_json(
            &format!("/alliances/{}/", id),
            organization_body(&format!("Org {}", id), id),
        );
    }
    let cancel = CancellationToken::new();
    let (_worker, handle) =
        spawn_worker(WorkerKind::Organization, &transport, &shared, &stores, &cancel);

    let orchestrator = Orchestrator::new(
        shared.clone(),
        vec![
            WorkflowStage::new(
                "organizations",
                Arc::new(EnumerateOrganizations::new(
                    test_client(transport.clone()),
                    shared.clone(),
                )),
                Queue::Organizations,
                Duration::from_secs(10),
            ),
            WorkflowStage::new(
                "suborganizations",
                Arc::new(WaitOnly),
                Queue::Suborganizations,
                Duration::from_secs(10),
            ),
        ],
        Duration::from_millis(20),
    );

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(outcome.is_success(), "{:?}", outcome);
    let ids = stores
        .entities
        .list_ids(EntityKind::Organization)
        .await
        .unwrap();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_orchestrator_fails_when_nobody_consumes() {
    let broker = MemoryBroker::new();
    let shared: Arc<dyn QueueBroker> = Arc::new(broker.clone());
    let transport = RoutedTransport::new();
    transport.respond_json("/alliances/", serde_json::json!([1, 2]));

    let orchestrator = Orchestrator::new(
        shared.clone(),
        vec![WorkflowStage::new(
            "organizations",
            Arc::new(EnumerateOrganizations::new(
                test_client(transport),
                shared.clone(),
            )),
            Queue::Organizations,
            Duration::from_millis(200),
        )],
        Duration::from_millis(20),
    );

    let outcome = orchestrator.run_once(&CancellationToken::new()).await;

    match outcome {
        RunOutcome::Failed {
            stage: 0,
            error: OrchestratorError::DrainTimeout { remaining, .. },
            ..
        } => assert_eq!(remaining, 2),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

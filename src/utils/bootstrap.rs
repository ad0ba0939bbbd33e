//! Bootstrap utilities for killfeed binaries.
//!
//! Shared initialization code: tracing, configuration, broker and storage
//! construction, and the shutdown signal.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_broker, QueueBroker};
use crate::config::{Config, LOG_ENV_VAR};
use crate::storage::{init_storage, Stores};
use crate::upstream::RateLimitedClient;
use crate::utils::retry::connection_backoff;

/// Initialize tracing with KILLFEED_LOG environment variable.
///
/// Defaults to "info" level if KILLFEED_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Shared runtime dependencies of every binary.
pub struct Runtime {
    pub config: Config,
    pub broker: Arc<dyn QueueBroker>,
    pub stores: Stores,
    pub client: RateLimitedClient,
}

/// Load configuration, connect the broker, open storage and start the
/// upstream limiter.
///
/// Broker connection is retried with backoff; other failures are fatal.
pub async fn bootstrap(
    service: &str,
    config_path: Option<&str>,
) -> Result<Runtime, Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load(config_path).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!(service, "Starting killfeed service");

    let broker = connect_with_retry("queue broker", || init_broker(&config.messaging)).await?;
    let stores = init_storage(&config.storage).await?;
    let client = RateLimitedClient::connect(&config.upstream)?;

    Ok(Runtime {
        config,
        broker,
        stores,
        client,
    })
}

/// Connect to a dependency with exponential backoff retry.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging
/// * `connect` - Async function that attempts to establish a connection
pub async fn connect_with_retry<T, E, F, Fut>(service_name: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    use backon::Retryable;

    connect
        .retry(connection_backoff())
        .notify(|e: &E, delay| {
            warn!(
                service = service_name,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Connection attempt failed"
            );
        })
        .await
        .map(|client| {
            info!(service = service_name, "Connected");
            client
        })
}

/// Cancel `token` when the process receives Ctrl-C / SIGTERM.
pub fn cancel_on_shutdown(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

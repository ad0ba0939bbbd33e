//! killfeed-worker: queue consumers
//!
//! Runs one or more worker kinds in a single process. Each kind consumes
//! its own queue; they share the upstream rate limiter, the broker
//! connection and storage.
//!
//! ```text
//! [broker] --organizations--> EntityWorker ----+
//!          --individuals----> EntityWorker ----+--> storage
//!          --loss_values----> ValueWorker -----+
//!          --discovery------> DiscoveryWorker --> [broker]
//! ```
//!
//! ## Configuration
//! - KILLFEED_CONFIG: path to the YAML configuration file
//! - KILLFEED_LOG: tracing filter (default: info)

use std::process::ExitCode;

use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use killfeed::utils::bootstrap::{bootstrap, cancel_on_shutdown, init_tracing};
use killfeed::workers::{WorkerKind, WorkerRuntime};

#[derive(Debug, Parser)]
#[command(name = "killfeed-worker", about = "Consume killfeed work queues")]
struct Args {
    /// Worker kinds to run.
    #[arg(value_enum, required_unless_present = "all")]
    kinds: Vec<WorkerKind>,

    /// Run every worker kind.
    #[arg(long, conflicts_with = "kinds")]
    all: bool,

    /// Configuration file.
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let runtime = match bootstrap("killfeed-worker", args.config.as_deref()).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let kinds = WorkerKind::selection(&args.kinds, args.all);

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let mut workers = JoinSet::new();
    for kind in kinds {
        let processor = kind.processor(&runtime.client, &runtime.broker, &runtime.stores);
        let worker = WorkerRuntime::new(
            runtime.broker.clone(),
            processor,
            runtime.config.workers.clone(),
        );
        let cancel = cancel.clone();
        workers.spawn(async move { (kind, worker.run(cancel).await) });
    }
    info!("killfeed-worker started");

    let mut failed = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((kind, Err(e))) => {
                error!(?kind, error = %e, "Worker failed, stopping the rest");
                failed = true;
                cancel.cancel();
            }
            Err(e) => {
                error!(error = %e, "Worker task panicked, stopping the rest");
                failed = true;
                cancel.cancel();
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        info!("killfeed-worker stopped");
        ExitCode::SUCCESS
    }
}

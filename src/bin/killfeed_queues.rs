//! killfeed-queues: operator tool
//!
//! Inspect and manipulate the work queues by hand:
//! - `status`: depth, consumers and dead letters of every queue
//! - `enqueue`: publish one id at operator priority
//! - `purge`: drop every ready message of a queue
//! - `value-backlog`: value every unvalued loss directly, bypassing the queue

use std::error::Error;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use killfeed::bus::QueueOptions;
use killfeed::message::{Mode, Queue, QueueMessage, TypedMessage, PRIORITY_OPERATOR};
use killfeed::monitor::{health_report, HealthReport};
use killfeed::utils::bootstrap::{bootstrap, init_tracing, Runtime};
use killfeed::workers::ValueAggregator;

/// Source tag on messages published by hand.
const OPERATOR_SOURCE: &str = "operator";

#[derive(Debug, Parser)]
#[command(name = "killfeed-queues", about = "Inspect and manage killfeed queues")]
struct Args {
    /// Configuration file.
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show depth, consumers and dead letters of every queue.
    Status {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Publish one id at operator priority.
    Enqueue {
        /// Queue name, short (`individuals`) or full (`killfeed.individuals`).
        queue: Queue,
        id: i64,
        /// Refetch even if the entity is already stored.
        #[arg(long)]
        refresh: bool,
    },
    /// Drop every ready message of a queue.
    Purge { queue: Queue },
    /// Value every unvalued loss now, in batches.
    ValueBacklog,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let runtime = match bootstrap("killfeed-queues", args.config.as_deref()).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match execute(args.command, &runtime).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, runtime: &Runtime) -> Result<(), Box<dyn Error + Send + Sync>> {
    match command {
        Command::Status { json } => {
            let report = health_report(runtime.broker.as_ref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Command::Enqueue { queue, id, refresh } => {
            let mut message =
                QueueMessage::new(id, OPERATOR_SOURCE).with_priority(PRIORITY_OPERATOR);
            if refresh {
                message = message.with_mode(Mode::Refresh);
            }
            TypedMessage::decode(queue, &message.to_bytes())?;

            runtime
                .broker
                .declare(queue.name(), QueueOptions::default())
                .await?;
            runtime.broker.publish(queue.name(), &message).await?;
            info!(%queue, id, refresh, "Enqueued");
        }
        Command::Purge { queue } => {
            let purged = runtime.broker.purge(queue.name()).await?;
            info!(%queue, purged, "Purged");
        }
        Command::ValueBacklog => {
            let aggregator = ValueAggregator::new(
                runtime.stores.prices.clone(),
                runtime.stores.losses.clone(),
            );
            let valued = aggregator
                .value_backlog(runtime.config.workers.value_batch_size)
                .await?;
            info!(valued, "Backlog valued");
        }
    }
    Ok(())
}

fn print_report(report: &HealthReport) {
    println!(
        "{:<36} {:>9} {:>9} {:>12}",
        "QUEUE", "MESSAGES", "CONSUMERS", "DEAD-LETTER"
    );
    for queue in &report.queues {
        if queue.exists {
            println!(
                "{:<36} {:>9} {:>9} {:>12}",
                queue.queue, queue.messages, queue.consumers, queue.dead_letters
            );
        } else {
            println!("{:<36} {:>9}", queue.queue, "missing");
        }
    }
    println!();
    println!("healthy: {}", report.healthy);
}

//! killfeed-orchestrator: daily workflow driver
//!
//! Publishes each stage's work and waits for its queue to drain before
//! starting the next:
//!
//! ```text
//! organizations -> discovery -> suborganizations -> values
//! ```
//!
//! By default the workflow runs once a day at `orchestrator.run_hour_utc`.
//! `--manual` runs it once and exits.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use killfeed::orchestrator::{default_stages, Orchestrator, RunOutcome};
use killfeed::utils::bootstrap::{bootstrap, cancel_on_shutdown, init_tracing};

#[derive(Debug, Parser)]
#[command(name = "killfeed-orchestrator", about = "Drive the daily killfeed workflow")]
struct Args {
    /// Run the workflow once now instead of on schedule.
    #[arg(long)]
    manual: bool,

    /// Configuration file.
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let runtime = match bootstrap("killfeed-orchestrator", args.config.as_deref()).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let config = &runtime.config.orchestrator;
    let stages = default_stages(
        config,
        runtime.client.clone(),
        runtime.broker.clone(),
        &runtime.stores,
    );
    let orchestrator = Orchestrator::new(runtime.broker.clone(), stages, config.poll_interval());

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    if !args.manual {
        orchestrator.run_scheduled(config.run_hour_utc, &cancel).await;
        info!("killfeed-orchestrator stopped");
        return ExitCode::SUCCESS;
    }

    match orchestrator.run_once(&cancel).await {
        RunOutcome::Succeeded => {
            info!("Manual run succeeded");
            ExitCode::SUCCESS
        }
        RunOutcome::Cancelled => {
            info!("Manual run cancelled");
            ExitCode::SUCCESS
        }
        RunOutcome::Failed { stage, name, error } => {
            error!(stage, %name, error = %error, "Manual run failed");
            ExitCode::FAILURE
        }
    }
}

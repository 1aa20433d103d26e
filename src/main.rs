//! Binary entry point: load config, init logging, run the supervisor until
//! a termination signal, then drain per `shutdownBehavior`. See spec.md §6.

use std::process::ExitCode;

use tracing_subscriber::prelude::*;

use spreadrunner_core::config::Config;
use spreadrunner_core::supervisor::Supervisor;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spreadrunner_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            // Logging isn't installed yet; a config load failure is fatal
            // and has nowhere else to go but stderr.
            eprintln!("fatal: failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing();
    for warning in config.drain_warnings() {
        tracing::warn!("{warning}");
    }

    let ledger_path = std::env::var("LEDGER_PATH").unwrap_or_else(|_| "trade-state.json".to_string());

    let supervisor = match Supervisor::initialize(&config, ledger_path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "fatal: supervisor initialization failed");
            return ExitCode::FAILURE;
        }
    };

    supervisor.run();
    tracing::info!("engine running, waiting for termination signal");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        return ExitCode::FAILURE;
    }

    tracing::info!("termination signal received, shutting down");
    supervisor.shutdown().await;
    ExitCode::SUCCESS
}

#![doc = include_str!("../README.md")]

mod config;
mod input;
mod telemetry;
mod unit;

use std::{process::ExitCode, time::Instant};

use clap::Parser;
use config::{CliArgs, RunConfig};
use spara::{CancelToken, Error};
use telemetry::init_telemetry;
use tokio::signal;
use unit::UnitError;

// Using mimalloc for lower allocation overhead across worker threads,
// especially in musl environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_UNIT_FAILED: u8 = 1;
const EXIT_STOPPED: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    init_telemetry()?;

    let items = input::read_items(&config)?;
    let scope = match config.timeout {
        Some(timeout) => CancelToken::with_timeout(timeout),
        None => CancelToken::new(),
    };
    log_startup_info(&config, items.len());

    let started = Instant::now();
    let total = items.len();
    let mut run = tokio::task::spawn_blocking({
        let scope = scope.clone();
        move || {
            unit::run_items(
                &config.command,
                &items,
                config.jobs,
                config.poll_interval,
                &scope,
            )
        }
    });

    let result = tokio::select! {
        joined = &mut run => joined?,
        () = shutdown_signal() => {
            scope.cancel();
            run.await?
        }
    };

    Ok(report(result, total, started))
}

fn report(result: Result<(), Error<UnitError>>, total: usize, started: Instant) -> ExitCode {
    let elapsed = started.elapsed();
    match result {
        Ok(()) => {
            tracing::info!("Completed {total} items in {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(Error::Work(err)) => {
            tracing::error!("Stopped after {elapsed:?}: {err}");
            ExitCode::from(EXIT_UNIT_FAILED)
        }
        Err(Error::Scope(reason)) => {
            tracing::warn!("Stopped after {elapsed:?}: {reason}");
            ExitCode::from(EXIT_STOPPED)
        }
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn log_startup_info(config: &RunConfig, items: usize) {
    if cfg!(debug_assertions) {
        tracing::info!("Running {items} items with full config: {config:#?}");
    } else {
        tracing::info!(
            "Running {items} items on {} workers: {}",
            config.jobs,
            config.command.program()
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, cancelling run...");
}

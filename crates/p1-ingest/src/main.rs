//! P1 Ingest - smart meter poller

use anyhow::{Context, Result};
use clap::Parser;
use p1_common::logging::{init_logging, LogConfig, LogLevel};
use p1_ingest::buffer::DurableBuffer;
use p1_ingest::config::{AppConfig, DEFAULT_CONFIG_PATH};
use p1_ingest::csv_import::{dry_run_statements, group_by_day, CsvLoader, DRY_RUN_DAYS};
use p1_ingest::db::{create_pool, health_check};
use p1_ingest::lock::PgAdvisoryLock;
use p1_ingest::meter::MeterClient;
use p1_ingest::models::Reading;
use p1_ingest::runner::{drain_buffer, IngestRunner, RunError};
use p1_ingest::scheduler::{interval_from_secs, Scheduler, SchedulerError};
use p1_ingest::storage::PgReadingStore;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status when a reading was neither persisted nor buffered
const EXIT_DATA_LOSS: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "p1-ingest")]
#[command(author, version, about = "Smart meter P1 poller")]
struct Cli {
    /// Path to the JSON (or .toml) config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run continuously under the advisory-lock scheduler
    #[arg(long = "loop")]
    run_loop: bool,

    /// Interval in seconds for loop mode (overrides interval_secs)
    #[arg(long)]
    interval: Option<i64>,

    /// Replay the retry buffer into the database and exit
    #[arg(long)]
    drain_buffer: bool,

    /// Fetch and parse (or render import SQL) without writing to the database
    #[arg(long)]
    dry_run: bool,

    /// Import power-15m.csv and gas-15m.csv from data_dir
    #[arg(long)]
    import: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::for_binary(log_level, "p1-ingest");

    // environment variables take precedence
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let data_loss = e
                .downcast_ref::<RunError>()
                .is_some_and(RunError::is_data_loss);
            let message = format!("{e:#}");
            error!(data_loss, error = %message, "p1-ingest failed");
            if data_loss {
                ExitCode::from(EXIT_DATA_LOSS)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!(config = %cli.config.display(), "p1-ingest starting");

    let config = AppConfig::load(&cli.config).context("Failed to load configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    if cli.import {
        return import_csv(&config, cli.dry_run).await;
    }

    if cli.run_loop {
        config.validate_for_loop()?;
    }

    let pool = create_pool(&config.db_dsn, &config.database).await?;
    health_check(&pool).await?;

    let store = PgReadingStore::connect(pool.clone()).await?;
    let buffer = DurableBuffer::new(&config.buffer_path);

    if cli.drain_buffer {
        let replayed = drain_buffer(&store, &buffer, &cancel).await?;
        info!(replayed, "Drain completed");
        return Ok(());
    }

    let meter = MeterClient::new(config.require_meter_endpoint()?, config.http_timeout())?;
    let runner = IngestRunner::new(meter, store, buffer);

    if cli.run_loop {
        let interval = cli
            .interval
            .map(interval_from_secs)
            .unwrap_or_else(|| config.interval());
        let lock =
            PgAdvisoryLock::new(pool).with_release_timeout(config.database.connect_timeout());
        let scheduler = Scheduler::new(lock, config.lock_key, interval);
        let (runner, dry_run) = (&runner, cli.dry_run);

        return match scheduler
            .run(&cancel, |cycle_cancel| async move {
                runner.run_once(&cycle_cancel, dry_run).await
            })
            .await
        {
            Err(SchedulerError::Cancelled) => {
                info!("Shutdown requested, scheduler stopped");
                Ok(())
            }
            Err(e) => Err(e.into()),
            Ok(()) => Ok(()),
        };
    }

    runner.run_once(&cancel, cli.dry_run).await?;
    info!("Run completed");
    Ok(())
}

async fn import_csv(config: &AppConfig, dry_run: bool) -> Result<()> {
    let data_dir = config.require_data_dir()?;
    info!(data_dir = %data_dir.display(), "Loading CSV files");

    let merged = CsvLoader::new(data_dir).load_and_merge()?;
    let days = group_by_day(&merged);
    info!(records = merged.len(), days = days.len(), "Loaded CSV records");

    if dry_run {
        info!(days = DRY_RUN_DAYS.min(days.len()), "Dry run: rendering SQL only");
        for (day, statement) in dry_run_statements(&days, DRY_RUN_DAYS) {
            info!(day = %day, "Batch statement");
            println!("{statement}");
        }
        return Ok(());
    }

    let pool = create_pool(&config.db_dsn, &config.database).await?;
    let store = PgReadingStore::connect(pool).await?;

    for (index, (day, merged)) in days.iter().enumerate() {
        let readings: Vec<Reading> = merged.iter().map(|m| m.to_reading()).collect();
        let inserted = store
            .insert_batch(&readings)
            .await
            .with_context(|| format!("Failed to insert day {day}"))?;
        info!(
            day = %day,
            progress = %format!("{}/{}", index + 1, days.len()),
            inserted,
            "Imported day"
        );
    }

    info!("Import completed");
    Ok(())
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    cancel.cancel();
}

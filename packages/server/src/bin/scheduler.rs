//! Scheduler daemon: runs the tick loop and maintenance sweeps against one
//! database.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadence_core::common::clock::{Clock, SystemClock};
use cadence_core::common::crypto::HeaderCipher;
use cadence_core::config::Config;
use cadence_core::domains::jobs::jobs_repo::{JobsRepo, PostgresJobsRepo};
use cadence_core::domains::jobs::runs_repo::{PostgresRunsRepo, RunsRepo};
use cadence_core::kernel::dispatcher::{Dispatch, HttpDispatcher};
use cadence_core::kernel::maintenance;
use cadence_core::kernel::scheduler::{Scheduler, SchedulerConfig};

#[derive(Parser)]
#[command(name = "scheduler")]
#[command(about = "Adaptive HTTP job scheduler daemon")]
struct Cli {
    /// Run a single tick and exit (useful for cron-driven deployments).
    #[arg(long)]
    once: bool,

    /// Override the configured claim batch size.
    #[arg(long)]
    batch_size: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let jobs: Arc<dyn JobsRepo> = Arc::new(PostgresJobsRepo::new(pool.clone()));
    let runs: Arc<dyn RunsRepo> = Arc::new(PostgresRunsRepo::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher: Arc<dyn Dispatch> = Arc::new(HttpDispatcher::new()?);
    let cipher = config.header_key.as_deref().map(HeaderCipher::from_secret);

    // Settle anything the previous process left in flight.
    maintenance::reconcile_on_startup(&runs, &clock, config.zombie_threshold_ms).await?;
    let sweeps = maintenance::start_maintenance(
        jobs.clone(),
        runs.clone(),
        clock.clone(),
        config.zombie_threshold_ms,
    )
    .await?;

    let mut scheduler_config = match &config.worker_id {
        Some(worker_id) => SchedulerConfig::with_worker_id(worker_id.clone()),
        None => SchedulerConfig::default(),
    };
    scheduler_config.batch_size = cli.batch_size.unwrap_or(config.batch_size);
    scheduler_config.max_concurrency = config.max_concurrency;
    scheduler_config.lease_margin_ms = config.lease_margin_ms;
    scheduler_config.drain_timeout = config.drain_timeout;

    let scheduler = Scheduler::new(jobs, runs, dispatcher, clock, cipher, scheduler_config);

    if cli.once {
        let claimed = scheduler.tick().await;
        info!(claimed, "single tick complete");
        return Ok(());
    }

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_stop.cancel();
    });

    scheduler.run_until(stop).await;

    let mut sweeps = sweeps;
    let _ = sweeps.shutdown().await;
    Ok(())
}

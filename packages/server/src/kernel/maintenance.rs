//! Periodic maintenance sweeps.
//!
//! Runs independently of the tick loop:
//! - zombie-run reconciliation every minute (runs whose worker died mid-flight
//!   are finalized as timeouts once their lease horizon is long gone)
//! - expired-hint cleanup every hour (the governor also clears lazily; the
//!   sweep catches endpoints that stopped being claimed)

use std::sync::Arc;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::common::clock::Clock;
use crate::domains::jobs::jobs_repo::JobsRepo;
use crate::domains::jobs::runs_repo::RunsRepo;

/// A provisional run older than this is considered abandoned. Comfortably
/// beyond any claim lease.
pub const DEFAULT_ZOMBIE_THRESHOLD_MS: i64 = 10 * 60 * 1000;

/// Start the maintenance schedules. The returned scheduler must stay alive
/// for the sweeps to keep firing.
pub async fn start_maintenance(
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    clock: Arc<dyn Clock>,
    zombie_threshold_ms: i64,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let sweep_runs = runs.clone();
    let sweep_clock = clock.clone();
    let zombie_job = Job::new_async("0 * * * * *", move |_uuid, _lock| {
        let runs = sweep_runs.clone();
        let clock = sweep_clock.clone();
        Box::pin(async move {
            match runs.cleanup_zombie_runs(zombie_threshold_ms, clock.now()).await {
                Ok(0) => {}
                Ok(reconciled) => info!(reconciled, "reconciled zombie runs"),
                Err(e) => error!(error = %e, "zombie run sweep failed"),
            }
        })
    })?;
    scheduler.add(zombie_job).await?;

    let hint_jobs = jobs.clone();
    let hint_clock = clock.clone();
    let hint_job = Job::new_async("0 0 * * * *", move |_uuid, _lock| {
        let jobs = hint_jobs.clone();
        let clock = hint_clock.clone();
        Box::pin(async move {
            match jobs.clear_expired_ai_hints(clock.now()).await {
                Ok(0) => {}
                Ok(cleared) => info!(cleared, "cleared expired hints"),
                Err(e) => error!(error = %e, "expired hint sweep failed"),
            }
        })
    })?;
    scheduler.add(hint_job).await?;

    scheduler.start().await?;
    info!("maintenance sweeps started (zombie runs every minute, expired hints hourly)");
    Ok(scheduler)
}

/// One-off reconciliation pass, run at startup before the loop begins so runs
/// orphaned by the previous process are settled immediately.
pub async fn reconcile_on_startup(
    runs: &Arc<dyn RunsRepo>,
    clock: &Arc<dyn Clock>,
    zombie_threshold_ms: i64,
) -> Result<u64> {
    let reconciled = runs
        .cleanup_zombie_runs(zombie_threshold_ms, clock.now())
        .await?;
    if reconciled > 0 {
        info!(reconciled, "reconciled zombie runs from previous process");
    }
    Ok(reconciled)
}

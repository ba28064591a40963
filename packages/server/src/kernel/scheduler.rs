//! The scheduling loop: claim → dispatch → record → re-plan.
//!
//! One scheduler process runs against one database. Within the process a
//! bounded pool of worker tasks fans out over the claimed batch; the claim
//! protocol guarantees no two workers ever hold the same endpoint.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::clock::Clock;
use crate::common::crypto::HeaderCipher;
use crate::domains::jobs::jobs_repo::JobsRepo;
use crate::domains::jobs::models::{far_future, AfterRun, Baseline, JobEndpoint, RunSource,
    MAX_TIMEOUT_MS};
use crate::domains::jobs::runs_repo::RunsRepo;
use crate::kernel::dispatcher::{Dispatch, DispatchRequest, Outcome};
use crate::kernel::governor;

/// Configuration for the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Identifies this process in lease ownership and logs.
    pub worker_id: String,
    /// Maximum endpoints claimed per tick.
    pub batch_size: i64,
    /// Cap on concurrent outbound dispatches.
    pub max_concurrency: usize,
    /// Safety margin added on top of twice the dispatch timeout ceiling.
    pub lease_margin_ms: i64,
    /// How long in-flight dispatches may drain after a stop signal.
    pub drain_timeout: Duration,
    /// Bounds on the adaptive sleep between ticks.
    pub min_sleep: Duration,
    pub max_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("scheduler-{}", Uuid::new_v4()),
            batch_size: 25,
            max_concurrency: 32,
            lease_margin_ms: 10_000,
            drain_timeout: Duration::from_secs(30),
            min_sleep: Duration::from_millis(100),
            max_sleep: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Claim lease covering the worst-case dispatch plus margin.
    pub fn lease_ms(&self) -> i64 {
        MAX_TIMEOUT_MS * 2 + self.lease_margin_ms
    }
}

pub struct Scheduler {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    dispatcher: Arc<dyn Dispatch>,
    clock: Arc<dyn Clock>,
    cipher: Option<HeaderCipher>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    /// Fires after the drain window to cut still-running dispatches short.
    abort: CancellationToken,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        dispatcher: Arc<dyn Dispatch>,
        clock: Arc<dyn Clock>,
        cipher: Option<HeaderCipher>,
        config: SchedulerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            jobs,
            runs,
            dispatcher,
            clock,
            cipher,
            config,
            workers,
            abort: CancellationToken::new(),
        }
    }

    /// One iteration: claim a batch and finalize every claimed endpoint.
    /// Returns the number of endpoints claimed.
    pub async fn tick(&self) -> usize {
        let now = self.clock.now();
        let claimed = match self
            .jobs
            .claim_due_endpoints(
                self.config.batch_size,
                self.config.lease_ms(),
                &self.config.worker_id,
                now,
            )
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "failed to claim endpoints");
                return 0;
            }
        };

        if claimed.is_empty() {
            return 0;
        }
        debug!(count = claimed.len(), "claimed endpoints");

        let tasks = claimed.iter().map(|id| self.process_endpoint(*id));
        join_all(tasks).await;
        claimed.len()
    }

    /// Run ticks until `stop` fires, sleeping adaptively between them.
    ///
    /// After `stop`, no new claims are made and in-flight dispatches get the
    /// configured drain window before being cut short and recorded as
    /// timeouts.
    pub async fn run_until(&self, stop: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "scheduler starting"
        );

        // Watchdog: bound the drain window once a stop has been requested.
        let watchdog_stop = stop.clone();
        let watchdog_abort = self.abort.clone();
        let drain = self.config.drain_timeout;
        let watchdog = tokio::spawn(async move {
            watchdog_stop.cancelled().await;
            tokio::time::sleep(drain).await;
            watchdog_abort.cancel();
        });

        loop {
            if stop.is_cancelled() {
                break;
            }

            let claimed = self.tick().await;

            // A full batch means there is likely more backlog: go again now.
            if claimed as i64 >= self.config.batch_size {
                continue;
            }

            let sleep = self.next_sleep().await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.clock.sleep(sleep) => {}
            }
        }

        watchdog.abort();
        info!(worker_id = %self.config.worker_id, "scheduler stopped");
    }

    /// Sleep until the earliest known due time, bounded to the configured
    /// window so new work and resumes are noticed promptly.
    async fn next_sleep(&self) -> Duration {
        let now = self.clock.now();
        let earliest = match self.jobs.earliest_next_run(now).await {
            Ok(earliest) => earliest,
            Err(e) => {
                warn!(error = %e, "failed to read earliest due time");
                None
            }
        };
        match earliest {
            Some(at) if at <= now => self.config.min_sleep,
            Some(at) => {
                let until = (at - now).to_std().unwrap_or(self.config.max_sleep);
                until.clamp(self.config.min_sleep, self.config.max_sleep)
            }
            None => self.config.max_sleep,
        }
    }

    /// The claim → dispatch → record → re-plan sequence for one endpoint.
    async fn process_endpoint(&self, endpoint_id: Uuid) {
        let _permit = self
            .workers
            .acquire()
            .await
            .expect("worker semaphore closed");

        let snapshot = match self.jobs.get_endpoint(endpoint_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(endpoint_id = %endpoint_id, "claimed endpoint vanished");
                let _ = self.jobs.clear_lock(endpoint_id).await;
                return;
            }
            Err(e) => {
                error!(endpoint_id = %endpoint_id, error = %e, "failed to load endpoint snapshot");
                let _ = self.jobs.clear_lock(endpoint_id).await;
                return;
            }
        };

        let started = self.clock.now();
        let provisional = provisional_source(&snapshot);
        let run_id = match self.runs.create(endpoint_id, started, provisional, 1).await {
            Ok(run_id) => run_id,
            Err(e) => {
                error!(endpoint_id = %endpoint_id, error = %e, "failed to create run, skipping endpoint this tick");
                let _ = self.jobs.clear_lock(endpoint_id).await;
                return;
            }
        };

        let outcome = self.dispatch_with_lease_renewal(&snapshot).await;
        let finished = self.clock.now();

        let (source, after) = match governor::plan_next(&snapshot, outcome.is_success(), finished) {
            Ok(decision) => (
                decision.source,
                AfterRun {
                    last_run_at: started,
                    failure_count: decision.failure_count,
                    next_run_at: decision.next_run_at,
                    paused_until: None,
                    clear_hint_next_run: decision.clear_hint_next_run,
                    clear_expired_hints: decision.clear_expired_hints,
                },
            ),
            Err(e) => {
                // The cron baseline stopped producing occurrences inside the
                // horizon. Park the endpoint until a human fixes the schedule;
                // the run itself is still recorded faithfully.
                warn!(endpoint_id = %endpoint_id, error = %e, "invalid schedule, parking endpoint");
                (
                    provisional,
                    AfterRun {
                        last_run_at: started,
                        failure_count: snapshot.failure_count,
                        next_run_at: far_future(),
                        paused_until: Some(far_future()),
                        clear_hint_next_run: false,
                        clear_expired_hints: false,
                    },
                )
            }
        };

        if let Err(e) = self.runs.finish(run_id, &outcome, source, finished).await {
            error!(run_id = %run_id, error = %e, "failed to finalize run");
        }
        if let Err(e) = self.jobs.update_after_run(endpoint_id, after).await {
            error!(endpoint_id = %endpoint_id, error = %e, "failed to persist post-run state");
            let _ = self.jobs.clear_lock(endpoint_id).await;
            return;
        }

        debug!(
            endpoint_id = %endpoint_id,
            run_id = %run_id,
            status = ?outcome.run_status(),
            source = %source,
            "endpoint finalized"
        );
    }

    /// Dispatch with a background lease-renewal heartbeat, so an endpoint
    /// whose call outlives the claim lease is not re-claimed mid-flight.
    async fn dispatch_with_lease_renewal(&self, endpoint: &JobEndpoint) -> Outcome {
        let request = match DispatchRequest::from_endpoint(endpoint, self.cipher.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                return Outcome::NetworkFailure {
                    error: e.to_string(),
                    duration_ms: 0,
                }
            }
        };
        let timeout_ms = request.timeout_ms;

        let renewal_cancel = CancellationToken::new();
        let renewal = {
            let cancel = renewal_cancel.clone();
            let jobs = self.jobs.clone();
            let clock = self.clock.clone();
            let endpoint_id = endpoint.id;
            let lease_ms = self.config.lease_ms();
            let owner = self.config.worker_id.clone();
            let interval = Duration::from_millis((lease_ms / 2).max(1_000) as u64);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(e) = jobs.set_lock(endpoint_id, lease_ms, &owner, clock.now()).await {
                                warn!(endpoint_id = %endpoint_id, error = %e, "lease renewal failed");
                            }
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            outcome = self.dispatcher.dispatch(request) => outcome,
            _ = self.abort.cancelled() => {
                // Shutdown drain expired: record the cut-short dispatch as a
                // timeout and let a later tick retry after backoff.
                Outcome::Timeout { duration_ms: timeout_ms }
            }
        };

        renewal_cancel.cancel();
        let _ = renewal.await;
        outcome
    }
}

/// Source stamped on the provisional run row. The governor's decision rewrites
/// it at finalize time; only runs abandoned by a crashed worker keep it.
fn provisional_source(endpoint: &JobEndpoint) -> RunSource {
    match endpoint.baseline() {
        Baseline::Cron(_) => RunSource::BaselineCron,
        Baseline::IntervalMs(_) => RunSource::BaselineInterval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.max_concurrency, 32);
        assert!(config.worker_id.starts_with("scheduler-"));
    }

    #[test]
    fn lease_covers_dispatch_ceiling_with_margin() {
        let config = SchedulerConfig::default();
        assert_eq!(config.lease_ms(), MAX_TIMEOUT_MS * 2 + 10_000);
    }
}

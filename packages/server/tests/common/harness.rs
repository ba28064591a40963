//! Deterministic world for scheduler tests: manual clock, in-memory repos,
//! and a scripted dispatcher standing in for the network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use cadence_core::common::clock::{Clock, ManualClock};
use cadence_core::domains::jobs::dashboard::DashboardManager;
use cadence_core::domains::jobs::jobs_repo::JobsRepo;
use cadence_core::domains::jobs::manager::{JobsManager, TierLimits};
use cadence_core::domains::jobs::planner::PlannerGateway;
use cadence_core::domains::jobs::runs_repo::RunsRepo;
use cadence_core::domains::jobs::sessions_repo::SessionsRepo;
use cadence_core::domains::jobs::testing::{
    InMemoryJobsRepo, InMemoryRunsRepo, InMemorySessionsRepo,
};
use cadence_core::kernel::dispatcher::{Dispatch, DispatchRequest, Outcome};
use cadence_core::kernel::scheduler::{Scheduler, SchedulerConfig};

/// Simulated network latency applied to every dispatch.
pub const DISPATCH_LATENCY_MS: i64 = 100;

/// Dispatcher that replays a scripted outcome sequence, advancing the manual
/// clock by a fixed latency per call. Once the script is exhausted every
/// dispatch succeeds.
pub struct ScriptedDispatcher {
    clock: Arc<ManualClock>,
    script: Mutex<VecDeque<Outcome>>,
    calls: Mutex<Vec<DispatchRequest>>,
}

impl ScriptedDispatcher {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_network_failure(&self, error: &str) {
        self.push(Outcome::NetworkFailure {
            error: error.to_string(),
            duration_ms: DISPATCH_LATENCY_MS,
        });
    }

    pub fn calls(&self) -> Vec<DispatchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn default_outcome() -> Outcome {
        Outcome::Success {
            status_code: 200,
            duration_ms: DISPATCH_LATENCY_MS,
            body: Some(serde_json::json!({"ok": true})),
        }
    }
}

#[async_trait]
impl Dispatch for ScriptedDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Outcome {
        self.calls.lock().unwrap().push(request);
        self.clock
            .advance(StdDuration::from_millis(DISPATCH_LATENCY_MS as u64));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Self::default_outcome)
    }
}

/// Everything a scenario needs, wired together.
pub struct World {
    pub clock: Arc<ManualClock>,
    pub jobs: Arc<InMemoryJobsRepo>,
    pub runs: Arc<InMemoryRunsRepo>,
    pub sessions: Arc<InMemorySessionsRepo>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub scheduler: Scheduler,
    pub manager: JobsManager,
    pub planner: PlannerGateway,
    pub dashboard: DashboardManager,
}

/// Default scenario start: Saturday 2025-10-04T00:00:00Z.
pub fn scenario_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap()
}

impl World {
    pub fn new() -> Self {
        Self::starting_at(scenario_start())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        let clock = ManualClock::new(start);
        let jobs = InMemoryJobsRepo::new();
        let runs = InMemoryRunsRepo::new(jobs.clone());
        let sessions = InMemorySessionsRepo::new(jobs.clone());
        let dispatcher = ScriptedDispatcher::new(clock.clone());

        let jobs_dyn: Arc<dyn JobsRepo> = jobs.clone();
        let runs_dyn: Arc<dyn RunsRepo> = runs.clone();
        let sessions_dyn: Arc<dyn SessionsRepo> = sessions.clone();
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let dispatcher_dyn: Arc<dyn Dispatch> = dispatcher.clone();

        let scheduler = Scheduler::new(
            jobs_dyn.clone(),
            runs_dyn.clone(),
            dispatcher_dyn,
            clock_dyn.clone(),
            None,
            SchedulerConfig::with_worker_id("test-worker"),
        );
        let manager = JobsManager::new(
            jobs_dyn.clone(),
            runs_dyn.clone(),
            sessions_dyn.clone(),
            clock_dyn.clone(),
            TierLimits::default(),
            None,
        );
        let planner = PlannerGateway::new(
            jobs_dyn.clone(),
            runs_dyn.clone(),
            sessions_dyn.clone(),
            clock_dyn.clone(),
        );
        let dashboard = DashboardManager::new(jobs_dyn, runs_dyn, sessions_dyn, clock_dyn);

        Self {
            clock,
            jobs,
            runs,
            sessions,
            dispatcher,
            scheduler,
            manager,
            planner,
            dashboard,
        }
    }

    /// A manager sharing this world's stores but with custom tier limits.
    pub fn manager_with_limits(&self, limits: TierLimits) -> JobsManager {
        JobsManager::new(
            self.jobs.clone(),
            self.runs.clone(),
            self.sessions.clone(),
            self.clock.clone(),
            limits,
            None,
        )
    }

    /// Jump the clock to `t` and run one tick.
    pub async fn tick_at(&self, t: DateTime<Utc>) -> usize {
        self.clock.set(t);
        self.scheduler.tick().await
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

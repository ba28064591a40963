//! In-memory repo implementations for deterministic tests.
//!
//! These mirror the Postgres repos' observable semantics: the claim applies
//! its filter and stamps the lease under a single lock, `finish` writes a run
//! exactly once, and every read is scoped the same way the SQL joins scope.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::common::pagination::{Page, PageArgs};
use crate::kernel::dispatcher::Outcome;
use super::jobs_repo::JobsRepo;
use super::models::{
    AfterRun, AiHint, AnalysisSession, EndpointCounts, EndpointPatch, Job, JobEndpoint, JobPatch,
    JobStatus, Run, RunSource, RunStatus,
};
use super::runs_repo::{
    EndpointBucket, Granularity, HealthSummary, MetricsFilter, ResponseSnapshot, RunBucket,
    RunFilter, RunMetrics, RunsRepo, SiblingResponse, ZOMBIE_ERROR_MESSAGE,
};
use super::sessions_repo::{SessionBucket, SessionsRepo};

fn truncate(t: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
            .unwrap(),
        Granularity::Day => Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
            .unwrap(),
    }
}

/// In-memory jobs/endpoints store.
#[derive(Default)]
pub struct InMemoryJobsRepo {
    jobs: RwLock<HashMap<Uuid, Job>>,
    endpoints: RwLock<HashMap<Uuid, JobEndpoint>>,
}

impl InMemoryJobsRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Direct snapshot access for assertions.
    pub fn endpoint(&self, id: Uuid) -> Option<JobEndpoint> {
        self.endpoints.read().unwrap().get(&id).cloned()
    }

    fn job_is_schedulable(&self, job_id: Uuid) -> bool {
        self.jobs
            .read()
            .unwrap()
            .get(&job_id)
            .is_some_and(|j| j.is_schedulable())
    }
}

#[async_trait]
impl JobsRepo for InMemoryJobsRepo {
    async fn create_job(&self, job: Job) -> Result<Job> {
        self.jobs.write().unwrap().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .get(&id)
            .filter(|j| j.user_id == user_id)
            .cloned())
    }

    async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.user_id == user_id && j.archived_at.is_none())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, user_id: Uuid, patch: JobPatch) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap();
        let Some(job) = jobs
            .get_mut(&id)
            .filter(|j| j.user_id == user_id && j.archived_at.is_none())
        else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = Some(description);
        }
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        user_id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap();
        let Some(job) = jobs.get_mut(&id).filter(|j| j.user_id == user_id) else {
            return Ok(None);
        };
        job.status = status;
        if status == JobStatus::Archived && job.archived_at.is_none() {
            job.archived_at = Some(now);
        }
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn add_endpoint(&self, endpoint: JobEndpoint) -> Result<JobEndpoint> {
        self.endpoints
            .write()
            .unwrap()
            .insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn update_endpoint(
        &self,
        id: Uuid,
        user_id: Uuid,
        patch: EndpointPatch,
    ) -> Result<Option<JobEndpoint>> {
        let mut endpoints = self.endpoints.write().unwrap();
        let Some(endpoint) = endpoints
            .get_mut(&id)
            .filter(|e| e.tenant_id == user_id && e.archived_at.is_none())
        else {
            return Ok(None);
        };
        patch.apply(endpoint);
        endpoint.updated_at = Utc::now();
        Ok(Some(endpoint.clone()))
    }

    async fn delete_endpoint(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut endpoints = self.endpoints.write().unwrap();
        let owned = endpoints
            .get(&id)
            .is_some_and(|e| e.tenant_id == user_id);
        if owned {
            endpoints.remove(&id);
        }
        Ok(owned)
    }

    async fn archive_endpoint(&self, id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut endpoints = self.endpoints.write().unwrap();
        let Some(endpoint) = endpoints
            .get_mut(&id)
            .filter(|e| e.tenant_id == user_id && e.archived_at.is_none())
        else {
            return Ok(false);
        };
        endpoint.archived_at = Some(now);
        endpoint.updated_at = now;
        Ok(true)
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<JobEndpoint>> {
        Ok(self.endpoints.read().unwrap().get(&id).cloned())
    }

    async fn get_endpoint_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<JobEndpoint>> {
        Ok(self
            .endpoints
            .read()
            .unwrap()
            .get(&id)
            .filter(|e| e.tenant_id == user_id)
            .cloned())
    }

    async fn list_endpoints_by_job(
        &self,
        job_id: Uuid,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<JobEndpoint>> {
        let mut endpoints: Vec<JobEndpoint> = self
            .endpoints
            .read()
            .unwrap()
            .values()
            .filter(|e| {
                e.job_id == job_id
                    && e.tenant_id == user_id
                    && (include_archived || e.archived_at.is_none())
            })
            .cloned()
            .collect();
        endpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(endpoints)
    }

    async fn endpoint_counts(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<EndpointCounts> {
        let endpoints = self.endpoints.read().unwrap();
        let mut counts = EndpointCounts::default();
        for endpoint in endpoints.values() {
            if endpoint.tenant_id != user_id || endpoint.archived_at.is_some() {
                continue;
            }
            counts.total += 1;
            if endpoint.is_paused(now) || !self.job_is_schedulable(endpoint.job_id) {
                counts.paused += 1;
            } else {
                counts.active += 1;
            }
        }
        Ok(counts)
    }

    async fn claim_due_endpoints(
        &self,
        batch_size: i64,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        // The whole filter-and-lease step happens under one write lock, which
        // is the in-memory equivalent of the single-statement SKIP LOCKED claim.
        let mut endpoints = self.endpoints.write().unwrap();

        let mut due: Vec<(DateTime<Utc>, Uuid)> = endpoints
            .values()
            .filter(|e| e.is_claimable(now) && self.job_is_schedulable(e.job_id))
            .map(|e| (e.next_run_at, e.id))
            .collect();
        due.sort();
        due.truncate(batch_size.max(0) as usize);

        let leased_until = now + Duration::milliseconds(lease_ms);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            let endpoint = endpoints.get_mut(&id).expect("claimed id exists");
            endpoint.leased_until = Some(leased_until);
            endpoint.lease_owner = Some(owner.to_string());
            endpoint.updated_at = now;
            claimed.push(id);
        }
        Ok(claimed)
    }

    async fn set_lock(
        &self,
        id: Uuid,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(endpoint) = self.endpoints.write().unwrap().get_mut(&id) {
            endpoint.leased_until = Some(now + Duration::milliseconds(lease_ms));
            endpoint.lease_owner = Some(owner.to_string());
            endpoint.updated_at = now;
        }
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        if let Some(endpoint) = self.endpoints.write().unwrap().get_mut(&id) {
            endpoint.leased_until = None;
            endpoint.lease_owner = None;
        }
        Ok(())
    }

    async fn set_next_run_at_if_earlier(&self, id: Uuid, t: DateTime<Utc>) -> Result<()> {
        if let Some(endpoint) = self
            .endpoints
            .write()
            .unwrap()
            .get_mut(&id)
            .filter(|e| e.archived_at.is_none())
        {
            if endpoint.next_run_at > t {
                endpoint.next_run_at = t;
            }
        }
        Ok(())
    }

    async fn write_ai_hint(&self, id: Uuid, hint: AiHint) -> Result<()> {
        if let Some(endpoint) = self
            .endpoints
            .write()
            .unwrap()
            .get_mut(&id)
            .filter(|e| e.archived_at.is_none())
        {
            endpoint.ai_hint_interval_ms = hint.interval_ms;
            endpoint.ai_hint_next_run_at = hint.next_run_at;
            endpoint.ai_hint_expires_at = Some(hint.expires_at);
            endpoint.ai_hint_reason = hint.reason;
        }
        Ok(())
    }

    async fn clear_ai_hints(&self, id: Uuid) -> Result<()> {
        if let Some(endpoint) = self.endpoints.write().unwrap().get_mut(&id) {
            endpoint.ai_hint_interval_ms = None;
            endpoint.ai_hint_next_run_at = None;
            endpoint.ai_hint_expires_at = None;
            endpoint.ai_hint_reason = None;
        }
        Ok(())
    }

    async fn clear_expired_ai_hints(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut cleared = 0;
        for endpoint in self.endpoints.write().unwrap().values_mut() {
            if endpoint.ai_hint_expires_at.is_some_and(|exp| exp <= now) {
                endpoint.ai_hint_interval_ms = None;
                endpoint.ai_hint_next_run_at = None;
                endpoint.ai_hint_expires_at = None;
                endpoint.ai_hint_reason = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn set_paused_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(endpoint) = self
            .endpoints
            .write()
            .unwrap()
            .get_mut(&id)
            .filter(|e| e.archived_at.is_none())
        {
            endpoint.paused_until = until;
            if until.is_none() {
                endpoint.next_run_at = endpoint.next_run_at.min(now + Duration::seconds(1));
            }
            endpoint.updated_at = now;
        }
        Ok(())
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<()> {
        if let Some(endpoint) = self.endpoints.write().unwrap().get_mut(&id) {
            endpoint.failure_count = 0;
        }
        Ok(())
    }

    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()> {
        if let Some(endpoint) = self.endpoints.write().unwrap().get_mut(&id) {
            endpoint.last_run_at = Some(update.last_run_at);
            endpoint.failure_count = update.failure_count;
            endpoint.next_run_at = update.next_run_at;
            if let Some(paused_until) = update.paused_until {
                endpoint.paused_until = Some(paused_until);
            }
            if update.clear_hint_next_run || update.clear_expired_hints {
                endpoint.ai_hint_next_run_at = None;
            }
            if update.clear_expired_hints {
                endpoint.ai_hint_interval_ms = None;
                endpoint.ai_hint_expires_at = None;
                endpoint.ai_hint_reason = None;
            }
            endpoint.leased_until = None;
            endpoint.lease_owner = None;
            endpoint.updated_at = update.last_run_at;
        }
        Ok(())
    }

    async fn earliest_next_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .endpoints
            .read()
            .unwrap()
            .values()
            .filter(|e| {
                e.archived_at.is_none()
                    && !e.is_paused(now)
                    && !e.is_leased(now)
                    && self.job_is_schedulable(e.job_id)
            })
            .map(|e| e.next_run_at)
            .min())
    }
}

/// In-memory run store. Holds a handle to the jobs store for the scoping the
/// SQL implementation does with joins.
pub struct InMemoryRunsRepo {
    jobs: Arc<InMemoryJobsRepo>,
    runs: RwLock<HashMap<Uuid, Run>>,
}

impl InMemoryRunsRepo {
    pub fn new(jobs: Arc<InMemoryJobsRepo>) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// All runs for an endpoint, newest first. For assertions.
    pub fn runs_for_endpoint(&self, endpoint_id: Uuid) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .unwrap()
            .values()
            .filter(|r| r.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs
    }

    fn endpoint_meta(&self, endpoint_id: Uuid) -> Option<(Uuid, Uuid, String)> {
        self.jobs
            .endpoints
            .read()
            .unwrap()
            .get(&endpoint_id)
            .map(|e| (e.tenant_id, e.job_id, e.name.clone()))
    }

    fn snapshot(run: &Run) -> ResponseSnapshot {
        ResponseSnapshot {
            run_id: run.id,
            endpoint_id: run.endpoint_id,
            status: run.status,
            status_code: run.status_code,
            finished_at: run.finished_at,
            response_body: run.response_body.clone(),
        }
    }
}

#[async_trait]
impl RunsRepo for InMemoryRunsRepo {
    async fn create(
        &self,
        endpoint_id: Uuid,
        started_at: DateTime<Utc>,
        source: RunSource,
        attempt: i32,
    ) -> Result<Uuid> {
        let run = Run {
            id: Uuid::now_v7(),
            endpoint_id,
            status: RunStatus::Failed,
            attempt,
            source,
            started_at,
            finished_at: None,
            duration_ms: None,
            status_code: None,
            error_message: None,
            response_body: None,
        };
        let id = run.id;
        self.runs.write().unwrap().insert(id, run);
        Ok(id)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        outcome: &Outcome,
        source: RunSource,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut runs = self.runs.write().unwrap();
        if let Some(run) = runs.get_mut(&run_id).filter(|r| r.finished_at.is_none()) {
            run.status = outcome.run_status();
            run.source = source;
            run.finished_at = Some(finished_at);
            run.duration_ms = Some(outcome.duration_ms());
            run.status_code = outcome.status_code();
            run.error_message = outcome.error_message();
            run.response_body = outcome.response_body().cloned();
        }
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter, page: PageArgs) -> Result<Page<Run>> {
        let mut matched: Vec<Run> = {
            let runs = self.runs.read().unwrap();
            runs.values()
                .filter(|r| {
                    let Some((tenant_id, job_id, _)) = self.endpoint_meta(r.endpoint_id) else {
                        return false;
                    };
                    tenant_id == filter.user_id
                        && filter.endpoint_id.is_none_or(|id| r.endpoint_id == id)
                        && filter.job_id.is_none_or(|id| job_id == id)
                        && filter.status.is_none_or(|s| r.status == s)
                        && filter.since.is_none_or(|t| r.started_at >= t)
                        && filter.until.is_none_or(|t| r.started_at <= t)
                })
                .cloned()
                .collect()
        };
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let total = matched.len() as i64;
        let items = matched
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();
        Ok(Page { items, total })
    }

    async fn get_run_details(&self, run_id: Uuid, user_id: Uuid) -> Result<Option<Run>> {
        Ok(self
            .runs
            .read()
            .unwrap()
            .get(&run_id)
            .filter(|r| {
                self.endpoint_meta(r.endpoint_id)
                    .is_some_and(|(tenant_id, _, _)| tenant_id == user_id)
            })
            .cloned())
    }

    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        window_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<HealthSummary> {
        let since = now - Duration::milliseconds(window_ms);
        let finished = self.runs_for_endpoint(endpoint_id);
        let finished: Vec<&Run> = finished.iter().filter(|r| r.finished_at.is_some()).collect();

        let in_window: Vec<&&Run> = finished.iter().filter(|r| r.started_at >= since).collect();
        let success_count = in_window
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .count() as i64;
        let failure_count = in_window.len() as i64 - success_count;
        let durations: Vec<i64> = in_window.iter().filter_map(|r| r.duration_ms).collect();
        let avg_duration_ms = (!durations.is_empty())
            .then(|| durations.iter().sum::<i64>() as f64 / durations.len() as f64);

        let failure_streak = finished
            .iter()
            .take_while(|r| r.status != RunStatus::Success)
            .count() as i64;

        Ok(HealthSummary {
            success_count,
            failure_count,
            avg_duration_ms,
            last_run: finished.first().map(|r| (*r).clone()),
            failure_streak,
        })
    }

    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>> {
        Ok(self
            .runs_for_endpoint(endpoint_id)
            .iter()
            .find(|r| r.finished_at.is_some())
            .map(Self::snapshot))
    }

    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ResponseSnapshot>> {
        Ok(self
            .runs_for_endpoint(endpoint_id)
            .iter()
            .filter(|r| r.finished_at.is_some())
            .take(limit.max(1) as usize)
            .map(Self::snapshot)
            .collect())
    }

    async fn get_sibling_latest_responses(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<SiblingResponse>> {
        let Some((_, job_id, _)) = self.endpoint_meta(endpoint_id) else {
            return Ok(Vec::new());
        };
        let siblings: Vec<(Uuid, String)> = {
            let endpoints = self.jobs.endpoints.read().unwrap();
            let mut siblings: Vec<(DateTime<Utc>, Uuid, String)> = endpoints
                .values()
                .filter(|e| e.job_id == job_id && e.id != endpoint_id && e.archived_at.is_none())
                .map(|e| (e.created_at, e.id, e.name.clone()))
                .collect();
            siblings.sort();
            siblings.into_iter().map(|(_, id, name)| (id, name)).collect()
        };

        let mut responses = Vec::with_capacity(siblings.len());
        for (sibling_id, name) in siblings {
            responses.push(SiblingResponse {
                endpoint_id: sibling_id,
                endpoint_name: name,
                latest: self.get_latest_response(sibling_id).await?,
            });
        }
        Ok(responses)
    }

    async fn get_filtered_metrics(&self, filter: &MetricsFilter) -> Result<RunMetrics> {
        let runs = self.runs.read().unwrap();
        let mut metrics = RunMetrics::default();
        let mut durations = Vec::new();

        for run in runs.values() {
            let Some((tenant_id, job_id, _)) = self.endpoint_meta(run.endpoint_id) else {
                continue;
            };
            if tenant_id != filter.user_id
                || filter.job_id.is_some_and(|id| job_id != id)
                || filter.source.is_some_and(|s| run.source != s)
                || run.started_at < filter.since
                || run.started_at > filter.until
            {
                continue;
            }
            metrics.total += 1;
            match run.status {
                RunStatus::Success => metrics.success += 1,
                RunStatus::Failed => metrics.failure += 1,
                RunStatus::Timeout => metrics.timeout += 1,
            }
            if let Some(d) = run.duration_ms {
                durations.push(d);
            }
        }
        metrics.avg_duration_ms = (!durations.is_empty())
            .then(|| durations.iter().sum::<i64>() as f64 / durations.len() as f64);
        Ok(metrics)
    }

    async fn get_run_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<RunBucket>> {
        let runs = self.runs.read().unwrap();
        let mut buckets: HashMap<DateTime<Utc>, (i64, i64)> = HashMap::new();

        for run in runs.values() {
            let owned = self
                .endpoint_meta(run.endpoint_id)
                .is_some_and(|(tenant_id, _, _)| tenant_id == user_id);
            if !owned || run.started_at < since || run.started_at > until {
                continue;
            }
            let entry = buckets
                .entry(truncate(run.started_at, granularity))
                .or_default();
            if run.status == RunStatus::Success {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }

        let mut series: Vec<RunBucket> = buckets
            .into_iter()
            .map(|(bucket, (success, failure))| RunBucket {
                bucket,
                success,
                failure,
            })
            .collect();
        series.sort_by_key(|b| b.bucket);
        Ok(series)
    }

    async fn get_endpoint_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<EndpointBucket>> {
        let runs = self.runs.read().unwrap();
        let mut cells: HashMap<(DateTime<Utc>, Uuid), (String, i64, i64, i64)> = HashMap::new();

        for run in runs.values() {
            let Some((tenant_id, _, name)) = self.endpoint_meta(run.endpoint_id) else {
                continue;
            };
            if tenant_id != user_id || run.started_at < since || run.started_at > until {
                continue;
            }
            let key = (truncate(run.started_at, granularity), run.endpoint_id);
            let cell = cells.entry(key).or_insert((name, 0, 0, 0));
            if run.status == RunStatus::Success {
                cell.1 += 1;
            } else {
                cell.2 += 1;
            }
            cell.3 += run.duration_ms.unwrap_or(0);
        }

        let mut series: Vec<EndpointBucket> = cells
            .into_iter()
            .map(
                |((bucket, endpoint_id), (endpoint_name, success, failure, total_duration_ms))| {
                    EndpointBucket {
                        bucket,
                        endpoint_id,
                        endpoint_name,
                        success,
                        failure,
                        total_duration_ms,
                    }
                },
            )
            .collect();
        series.sort_by_key(|b| (b.bucket, b.endpoint_id));
        Ok(series)
    }

    async fn cleanup_zombie_runs(&self, threshold_ms: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::milliseconds(threshold_ms);
        let mut reconciled = 0;
        for run in self.runs.write().unwrap().values_mut() {
            if run.finished_at.is_none() && run.started_at < cutoff {
                run.status = RunStatus::Timeout;
                run.finished_at = Some(now);
                run.duration_ms = Some((now - run.started_at).num_milliseconds());
                run.error_message = Some(ZOMBIE_ERROR_MESSAGE.to_string());
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<i64> {
        Ok(self
            .runs
            .read()
            .unwrap()
            .values()
            .filter(|r| r.endpoint_id == endpoint_id)
            .count() as i64)
    }

    async fn count_for_job(&self, job_id: Uuid) -> Result<i64> {
        Ok(self
            .runs
            .read()
            .unwrap()
            .values()
            .filter(|r| {
                self.endpoint_meta(r.endpoint_id)
                    .is_some_and(|(_, j, _)| j == job_id)
            })
            .count() as i64)
    }
}

/// In-memory analysis session store.
pub struct InMemorySessionsRepo {
    jobs: Arc<InMemoryJobsRepo>,
    sessions: RwLock<Vec<AnalysisSession>>,
}

impl InMemorySessionsRepo {
    pub fn new(jobs: Arc<InMemoryJobsRepo>) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            sessions: RwLock::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SessionsRepo for InMemorySessionsRepo {
    async fn record_session(&self, session: AnalysisSession) -> Result<AnalysisSession> {
        self.sessions.write().unwrap().push(session.clone());
        Ok(session)
    }

    async fn list_sessions(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<AnalysisSession>> {
        let mut sessions: Vec<AnalysisSession> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.endpoint_id == endpoint_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.analyzed_at.cmp(&a.analyzed_at));
        sessions.truncate(limit.max(1) as usize);
        Ok(sessions)
    }

    async fn latest_session(&self, endpoint_id: Uuid) -> Result<Option<AnalysisSession>> {
        Ok(self.list_sessions(endpoint_id, 1).await?.into_iter().next())
    }

    async fn session_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<SessionBucket>> {
        let endpoints = self.jobs.endpoints.read().unwrap();
        let mut buckets: HashMap<DateTime<Utc>, i64> = HashMap::new();

        for session in self.sessions.read().unwrap().iter() {
            let owned = endpoints
                .get(&session.endpoint_id)
                .is_some_and(|e| e.tenant_id == user_id);
            if !owned || session.analyzed_at < since || session.analyzed_at > until {
                continue;
            }
            *buckets
                .entry(truncate(session.analyzed_at, granularity))
                .or_default() += 1;
        }

        let mut series: Vec<SessionBucket> = buckets
            .into_iter()
            .map(|(bucket, sessions)| SessionBucket { bucket, sessions })
            .collect();
        series.sort_by_key(|b| b.bucket);
        Ok(series)
    }
}

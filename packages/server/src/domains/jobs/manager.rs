//! User-facing surface over jobs, endpoints, and the adaptive-hint writes.
//!
//! All operations are scoped by the calling [`Actor`]; anything addressing a
//! resource the actor does not own comes back as [`JobsError::NotFound`] so
//! existence never leaks across users.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;
use typed_builder::TypedBuilder;
use url::Url;
use uuid::Uuid;

use crate::common::auth::{Actor, Tier};
use crate::common::clock::Clock;
use crate::common::crypto::{seal_headers, HeaderCipher};
use crate::common::pagination::{Page, PageArgs};
use crate::kernel::cron::CronExpr;
use crate::kernel::governor;
use super::jobs_repo::JobsRepo;
use super::models::{
    AiHint, EndpointCounts, EndpointPatch, HttpMethod, Job, JobEndpoint, JobPatch, JobStatus, Run,
};
use super::runs_repo::{HealthSummary, ResponseSnapshot, RunFilter, RunsRepo, SiblingResponse};
use super::sessions_repo::SessionsRepo;
use super::models::AnalysisSession;

#[derive(Debug, Error)]
pub enum JobsError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("endpoint limit reached: your plan allows at most {limit} live endpoints")]
    EndpointLimitReached { limit: i64 },
    #[error("not found")]
    NotFound,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("operation failed")]
    Storage(#[from] anyhow::Error),
}

/// Live-endpoint ceilings per subscription tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub free: i64,
    pub pro: i64,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self { free: 10, pro: 100 }
    }
}

impl TierLimits {
    pub fn limit_for(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
        }
    }
}

/// Input for creating a job container.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
}

/// Input for registering an endpoint under a job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewEndpoint {
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    #[builder(default, setter(strip_option))]
    pub baseline_cron: Option<String>,
    #[builder(default, setter(strip_option))]
    pub baseline_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub min_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_interval_ms: Option<i64>,
    pub url: String,
    #[builder(default)]
    pub method: HttpMethod,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    #[builder(default, setter(strip_option))]
    pub body_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_execution_time_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_response_size_kb: Option<i64>,
}

/// User-facing manager. Thin on purpose: validation and scoping here, storage
/// semantics in the repos, scheduling decisions in the governor.
pub struct JobsManager {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    sessions: Arc<dyn SessionsRepo>,
    clock: Arc<dyn Clock>,
    limits: TierLimits,
    cipher: Option<HeaderCipher>,
}

impl JobsManager {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        sessions: Arc<dyn SessionsRepo>,
        clock: Arc<dyn Clock>,
        limits: TierLimits,
        cipher: Option<HeaderCipher>,
    ) -> Self {
        Self {
            jobs,
            runs,
            sessions,
            clock,
            limits,
            cipher,
        }
    }

    // ------------------------------------------------------------------
    // Job containers
    // ------------------------------------------------------------------

    pub async fn create_job(&self, actor: Actor, input: NewJob) -> Result<Job, JobsError> {
        if input.name.trim().is_empty() {
            return Err(JobsError::Validation("job name must not be empty".into()));
        }
        let now = self.clock.now();
        let job = Job::builder()
            .user_id(actor.user_id)
            .name(input.name.trim().to_string())
            .created_at(now)
            .updated_at(now);
        let job = match input.description {
            Some(description) => job.description(description).build(),
            None => job.build(),
        };
        Ok(self.jobs.create_job(job).await?)
    }

    pub async fn get_job(&self, actor: Actor, job_id: Uuid) -> Result<Job, JobsError> {
        self.jobs
            .get_job(job_id, actor.user_id)
            .await?
            .ok_or(JobsError::NotFound)
    }

    pub async fn list_jobs(&self, actor: Actor) -> Result<Vec<Job>, JobsError> {
        Ok(self.jobs.list_jobs(actor.user_id).await?)
    }

    pub async fn update_job(
        &self,
        actor: Actor,
        job_id: Uuid,
        patch: JobPatch,
    ) -> Result<Job, JobsError> {
        self.jobs
            .update_job(job_id, actor.user_id, patch)
            .await?
            .ok_or(JobsError::NotFound)
    }

    pub async fn archive_job(&self, actor: Actor, job_id: Uuid) -> Result<Job, JobsError> {
        self.set_job_status(actor, job_id, JobStatus::Archived).await
    }

    pub async fn pause_job(&self, actor: Actor, job_id: Uuid) -> Result<Job, JobsError> {
        self.set_job_status(actor, job_id, JobStatus::Paused).await
    }

    pub async fn resume_job(&self, actor: Actor, job_id: Uuid) -> Result<Job, JobsError> {
        self.set_job_status(actor, job_id, JobStatus::Active).await
    }

    async fn set_job_status(
        &self,
        actor: Actor,
        job_id: Uuid,
        status: JobStatus,
    ) -> Result<Job, JobsError> {
        self.jobs
            .set_job_status(job_id, actor.user_id, status, self.clock.now())
            .await?
            .ok_or(JobsError::NotFound)
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    pub async fn add_endpoint(
        &self,
        actor: Actor,
        job_id: Uuid,
        input: NewEndpoint,
    ) -> Result<JobEndpoint, JobsError> {
        let job = self.get_job(actor, job_id).await?;

        validate_endpoint_config(
            &input.baseline_cron,
            input.baseline_interval_ms,
            input.min_interval_ms,
            input.max_interval_ms,
            &input.url,
            input.timeout_ms,
            input.max_response_size_kb,
        )?;

        let now = self.clock.now();
        let limit = self.limits.limit_for(actor.tier);
        let counts = self.jobs.endpoint_counts(actor.user_id, now).await?;
        if counts.total >= limit {
            return Err(JobsError::EndpointLimitReached { limit });
        }

        let headers = seal_headers(self.cipher.as_ref(), &input.headers)
            .map_err(JobsError::Storage)?;

        let mut endpoint = JobEndpoint::builder()
            .job_id(job.id)
            .tenant_id(actor.user_id)
            .name(input.name)
            .url(input.url)
            .method(input.method)
            .headers_json(sqlx::types::Json(headers))
            .next_run_at(now)
            .created_at(now)
            .updated_at(now)
            .build();
        endpoint.description = input.description;
        endpoint.baseline_cron = input.baseline_cron;
        endpoint.baseline_interval_ms = input.baseline_interval_ms;
        endpoint.min_interval_ms = input.min_interval_ms;
        endpoint.max_interval_ms = input.max_interval_ms;
        endpoint.body_json = input.body_json;
        endpoint.timeout_ms = input.timeout_ms;
        endpoint.max_execution_time_ms = input.max_execution_time_ms;
        endpoint.max_response_size_kb = input.max_response_size_kb;

        // The first fire time comes from the baseline rule alone.
        let (next_run_at, _) = governor::baseline_next(&endpoint, now)
            .map_err(|e| JobsError::InvalidSchedule(e.to_string()))?;
        endpoint.next_run_at = next_run_at;

        Ok(self.jobs.add_endpoint(endpoint).await?)
    }

    pub async fn update_endpoint(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        mut patch: EndpointPatch,
    ) -> Result<JobEndpoint, JobsError> {
        let current = self.get_endpoint(actor, endpoint_id).await?;

        // Validate against the merged state so a partial patch cannot smuggle
        // the config into an invalid shape.
        let mut merged = current.clone();
        patch.clone().apply(&mut merged);
        validate_endpoint_config(
            &merged.baseline_cron,
            merged.baseline_interval_ms,
            merged.min_interval_ms,
            merged.max_interval_ms,
            &merged.url,
            merged.timeout_ms,
            merged.max_response_size_kb,
        )?;

        if let Some(headers) = patch.headers_json.take() {
            let sealed =
                seal_headers(self.cipher.as_ref(), &headers).map_err(JobsError::Storage)?;
            patch.headers_json = Some(sealed);
        }

        self.jobs
            .update_endpoint(endpoint_id, actor.user_id, patch)
            .await?
            .ok_or(JobsError::NotFound)
    }

    pub async fn get_endpoint(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
    ) -> Result<JobEndpoint, JobsError> {
        self.jobs
            .get_endpoint_for_user(endpoint_id, actor.user_id)
            .await?
            .ok_or(JobsError::NotFound)
    }

    pub async fn list_endpoints(
        &self,
        actor: Actor,
        job_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<JobEndpoint>, JobsError> {
        // Listing under a foreign job is indistinguishable from an empty job.
        self.get_job(actor, job_id).await?;
        Ok(self
            .jobs
            .list_endpoints_by_job(job_id, actor.user_id, include_archived)
            .await?)
    }

    pub async fn endpoint_counts(&self, actor: Actor) -> Result<EndpointCounts, JobsError> {
        Ok(self
            .jobs
            .endpoint_counts(actor.user_id, self.clock.now())
            .await?)
    }

    pub async fn archive_endpoint(&self, actor: Actor, endpoint_id: Uuid) -> Result<(), JobsError> {
        let archived = self
            .jobs
            .archive_endpoint(endpoint_id, actor.user_id, self.clock.now())
            .await?;
        if !archived {
            return Err(JobsError::NotFound);
        }
        Ok(())
    }

    /// Endpoints with recorded runs cannot be deleted, only archived, so the
    /// run history stays consistent.
    pub async fn delete_endpoint(&self, actor: Actor, endpoint_id: Uuid) -> Result<(), JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        let run_count = self.runs.count_for_endpoint(endpoint_id).await?;
        if run_count > 0 {
            return Err(JobsError::Validation(
                "endpoint has recorded runs; archive it instead".into(),
            ));
        }
        let deleted = self
            .jobs
            .delete_endpoint(endpoint_id, actor.user_id)
            .await?;
        if !deleted {
            return Err(JobsError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run history
    // ------------------------------------------------------------------

    pub async fn list_runs(
        &self,
        actor: Actor,
        mut filter: RunFilter,
        page: PageArgs,
    ) -> Result<Page<Run>, JobsError> {
        filter.user_id = actor.user_id;
        Ok(self.runs.list_runs(&filter, page).await?)
    }

    pub async fn get_run(&self, actor: Actor, run_id: Uuid) -> Result<Run, JobsError> {
        self.runs
            .get_run_details(run_id, actor.user_id)
            .await?
            .ok_or(JobsError::NotFound)
    }

    // ------------------------------------------------------------------
    // Adaptive surface
    // ------------------------------------------------------------------

    pub async fn apply_interval_hint(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        interval_ms: i64,
        ttl_minutes: i64,
        reason: Option<String>,
    ) -> Result<(), JobsError> {
        if interval_ms <= 0 {
            return Err(JobsError::Validation("hint interval must be positive".into()));
        }
        if ttl_minutes <= 0 {
            return Err(JobsError::Validation("hint ttl must be positive".into()));
        }
        let endpoint = self.get_endpoint(actor, endpoint_id).await?;
        let now = self.clock.now();

        let hint = AiHint::builder()
            .interval_ms(interval_ms)
            .expires_at(now + Duration::minutes(ttl_minutes))
            .build();
        let hint = match reason {
            Some(reason) => AiHint { reason: Some(reason), ..hint },
            None => hint,
        };
        self.jobs.write_ai_hint(endpoint_id, hint).await?;

        // Nudge the schedule so the hint takes effect on the next tick rather
        // than after the current (possibly long) interval elapses.
        let clamped = clamp_interval(&endpoint, interval_ms);
        self.jobs
            .set_next_run_at_if_earlier(endpoint_id, now + Duration::milliseconds(clamped))
            .await?;
        debug!(endpoint_id = %endpoint_id, interval_ms, "interval hint applied");
        Ok(())
    }

    pub async fn apply_one_shot_hint(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        next_run_at: DateTime<Utc>,
        ttl_minutes: i64,
        reason: Option<String>,
    ) -> Result<(), JobsError> {
        if ttl_minutes <= 0 {
            return Err(JobsError::Validation("hint ttl must be positive".into()));
        }
        let endpoint = self.get_endpoint(actor, endpoint_id).await?;
        let now = self.clock.now();

        let hint = AiHint::builder()
            .next_run_at(next_run_at)
            .expires_at(now + Duration::minutes(ttl_minutes))
            .build();
        let hint = match reason {
            Some(reason) => AiHint { reason: Some(reason), ..hint },
            None => hint,
        };
        self.jobs.write_ai_hint(endpoint_id, hint).await?;

        let earliest_allowed = endpoint
            .min_interval_ms
            .map(|min| now + Duration::milliseconds(min))
            .unwrap_or(now);
        self.jobs
            .set_next_run_at_if_earlier(endpoint_id, next_run_at.max(earliest_allowed))
            .await?;
        debug!(endpoint_id = %endpoint_id, next_run_at = %next_run_at, "one-shot hint applied");
        Ok(())
    }

    pub async fn pause_endpoint(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> Result<(), JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        self.jobs
            .set_paused_until(endpoint_id, until, self.clock.now())
            .await?;
        Ok(())
    }

    pub async fn clear_hints(&self, actor: Actor, endpoint_id: Uuid) -> Result<(), JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        self.jobs.clear_ai_hints(endpoint_id).await?;
        Ok(())
    }

    pub async fn reset_failures(&self, actor: Actor, endpoint_id: Uuid) -> Result<(), JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        self.jobs.reset_failure_count(endpoint_id).await?;
        Ok(())
    }

    /// Fire the endpoint as soon as the next tick can claim it.
    pub async fn trigger_run(&self, actor: Actor, endpoint_id: Uuid) -> Result<(), JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        self.jobs
            .set_next_run_at_if_earlier(endpoint_id, self.clock.now())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planner-facing reads (ownership-scoped)
    // ------------------------------------------------------------------

    pub async fn health_summary(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        window_ms: i64,
    ) -> Result<HealthSummary, JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        Ok(self
            .runs
            .get_health_summary(endpoint_id, window_ms, self.clock.now())
            .await?)
    }

    pub async fn latest_response(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
    ) -> Result<Option<ResponseSnapshot>, JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        Ok(self.runs.get_latest_response(endpoint_id).await?)
    }

    pub async fn response_history(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ResponseSnapshot>, JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        Ok(self.runs.get_response_history(endpoint_id, limit).await?)
    }

    pub async fn sibling_latest_responses(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
    ) -> Result<Vec<SiblingResponse>, JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        Ok(self.runs.get_sibling_latest_responses(endpoint_id).await?)
    }

    pub async fn list_sessions(
        &self,
        actor: Actor,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AnalysisSession>, JobsError> {
        self.get_endpoint(actor, endpoint_id).await?;
        Ok(self.sessions.list_sessions(endpoint_id, limit).await?)
    }
}

/// Bound an interval by the endpoint's guardrails.
fn clamp_interval(endpoint: &JobEndpoint, interval_ms: i64) -> i64 {
    let mut clamped = interval_ms;
    if let Some(min) = endpoint.min_interval_ms {
        clamped = clamped.max(min);
    }
    if let Some(max) = endpoint.max_interval_ms {
        clamped = clamped.min(max);
    }
    clamped
}

fn validate_endpoint_config(
    baseline_cron: &Option<String>,
    baseline_interval_ms: Option<i64>,
    min_interval_ms: Option<i64>,
    max_interval_ms: Option<i64>,
    url: &str,
    timeout_ms: Option<i64>,
    max_response_size_kb: Option<i64>,
) -> Result<(), JobsError> {
    match (baseline_cron, baseline_interval_ms) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(JobsError::Validation(
                "exactly one of baseline_cron and baseline_interval_ms is required".into(),
            ))
        }
        (Some(cron), None) => {
            CronExpr::parse(cron).map_err(|e| JobsError::Validation(e.to_string()))?;
        }
        (None, Some(interval)) => {
            if interval <= 0 {
                return Err(JobsError::Validation(
                    "baseline interval must be positive".into(),
                ));
            }
        }
    }

    if let Some(min) = min_interval_ms {
        if min <= 0 {
            return Err(JobsError::Validation("min interval must be positive".into()));
        }
    }
    if let Some(max) = max_interval_ms {
        if max <= 0 {
            return Err(JobsError::Validation("max interval must be positive".into()));
        }
    }
    if let (Some(min), Some(max)) = (min_interval_ms, max_interval_ms) {
        if min > max {
            return Err(JobsError::Validation(
                "min interval must not exceed max interval".into(),
            ));
        }
    }

    let parsed = Url::parse(url)
        .map_err(|e| JobsError::Validation(format!("invalid url: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(JobsError::Validation(
            "url must use the http or https scheme".into(),
        ));
    }

    if timeout_ms.is_some_and(|t| t <= 0) {
        return Err(JobsError::Validation("timeout must be positive".into()));
    }
    if max_response_size_kb.is_some_and(|kb| kb <= 0) {
        return Err(JobsError::Validation(
            "max response size must be positive".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_baseline() {
        let result = validate_endpoint_config(
            &None,
            None,
            None,
            None,
            "https://example.com",
            None,
            None,
        );
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }

    #[test]
    fn rejects_both_baselines() {
        let result = validate_endpoint_config(
            &Some("* * * * *".into()),
            Some(60_000),
            None,
            None,
            "https://example.com",
            None,
            None,
        );
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }

    #[test]
    fn rejects_inverted_clamps() {
        let result = validate_endpoint_config(
            &None,
            Some(60_000),
            Some(600_000),
            Some(60_000),
            "https://example.com",
            None,
            None,
        );
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }

    #[test]
    fn rejects_non_http_url() {
        let result = validate_endpoint_config(
            &None,
            Some(60_000),
            None,
            None,
            "ftp://example.com",
            None,
            None,
        );
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }

    #[test]
    fn rejects_bad_cron() {
        let result = validate_endpoint_config(
            &Some("not cron".into()),
            None,
            None,
            None,
            "https://example.com",
            None,
            None,
        );
        assert!(matches!(result, Err(JobsError::Validation(_))));
    }

    #[test]
    fn accepts_valid_config() {
        let result = validate_endpoint_config(
            &Some("*/10 * * * *".into()),
            None,
            Some(60_000),
            Some(3_600_000),
            "https://example.com/api",
            Some(10_000),
            Some(128),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn clamp_interval_applies_both_bounds() {
        let endpoint = JobEndpoint::builder()
            .job_id(Uuid::new_v4())
            .tenant_id(Uuid::new_v4())
            .name("probe")
            .url("https://example.com")
            .baseline_interval_ms(60_000i64)
            .min_interval_ms(30_000i64)
            .max_interval_ms(600_000i64)
            .next_run_at(Utc::now())
            .build();

        assert_eq!(clamp_interval(&endpoint, 5_000), 30_000);
        assert_eq!(clamp_interval(&endpoint, 1_000_000), 600_000);
        assert_eq!(clamp_interval(&endpoint, 120_000), 120_000);
    }
}

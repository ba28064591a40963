//! Endpoint store and the claim-lease protocol.
//!
//! The claim is the one operation the whole concurrency argument rests on:
//! a single statement selects due endpoints with `FOR UPDATE SKIP LOCKED`
//! and stamps the lease in the same atomic step, so no two workers can ever
//! observe the same endpoint as claimable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::common::db::with_retries;
use super::models::{
    AfterRun, AiHint, EndpointCounts, EndpointPatch, Job, JobEndpoint, JobPatch, JobStatus,
};

/// Claim attempts that cannot make progress within this budget return an
/// empty batch instead of blocking the tick loop.
pub const CLAIM_TIMEOUT_MS: i64 = 500;

const ENDPOINT_COLUMNS: &str = "id, job_id, tenant_id, name, description, \
     baseline_cron, baseline_interval_ms, min_interval_ms, max_interval_ms, \
     url, method, headers_json, body_json, timeout_ms, max_execution_time_ms, max_response_size_kb, \
     next_run_at, last_run_at, failure_count, leased_until, lease_owner, \
     ai_hint_interval_ms, ai_hint_next_run_at, ai_hint_expires_at, ai_hint_reason, \
     paused_until, archived_at, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, user_id, name, description, status, created_at, updated_at, archived_at";

/// Storage contract for jobs, endpoints, leases, and hints.
///
/// The repo trusts its caller to have authorized the user; manager-layer code
/// scopes every id-addressed operation by the owning user.
#[async_trait]
pub trait JobsRepo: Send + Sync {
    // Job containers.
    async fn create_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>>;
    async fn update_job(&self, id: Uuid, user_id: Uuid, patch: JobPatch) -> Result<Option<Job>>;
    async fn set_job_status(
        &self,
        id: Uuid,
        user_id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    // Endpoints.
    async fn add_endpoint(&self, endpoint: JobEndpoint) -> Result<JobEndpoint>;
    async fn update_endpoint(
        &self,
        id: Uuid,
        user_id: Uuid,
        patch: EndpointPatch,
    ) -> Result<Option<JobEndpoint>>;
    async fn delete_endpoint(&self, id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn archive_endpoint(&self, id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
    async fn get_endpoint(&self, id: Uuid) -> Result<Option<JobEndpoint>>;
    async fn get_endpoint_for_user(&self, id: Uuid, user_id: Uuid)
        -> Result<Option<JobEndpoint>>;
    async fn list_endpoints_by_job(
        &self,
        job_id: Uuid,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<JobEndpoint>>;
    async fn endpoint_counts(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<EndpointCounts>;

    // Scheduler surface.
    async fn claim_due_endpoints(
        &self,
        batch_size: i64,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>>;
    async fn set_lock(
        &self,
        id: Uuid,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn clear_lock(&self, id: Uuid) -> Result<()>;
    async fn set_next_run_at_if_earlier(&self, id: Uuid, t: DateTime<Utc>) -> Result<()>;
    async fn write_ai_hint(&self, id: Uuid, hint: AiHint) -> Result<()>;
    async fn clear_ai_hints(&self, id: Uuid) -> Result<()>;
    async fn clear_expired_ai_hints(&self, now: DateTime<Utc>) -> Result<u64>;
    async fn set_paused_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn reset_failure_count(&self, id: Uuid) -> Result<()>;
    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()>;
    async fn earliest_next_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;
}

/// PostgreSQL-backed implementation.
pub struct PostgresJobsRepo {
    pool: PgPool,
}

impl PostgresJobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn is_statement_timeout(e: &sqlx::Error) -> bool {
        matches!(
            e,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57014")
        )
    }
}

#[async_trait]
impl JobsRepo for PostgresJobsRepo {
    async fn create_job(&self, job: Job) -> Result<Job> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {JOB_COLUMNS}"
        );
        let created = sqlx::query_as::<_, Job>(&sql)
            .bind(job.id)
            .bind(job.user_id)
            .bind(&job.name)
            .bind(&job.description)
            .bind(job.status)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.archived_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(created)
    }

    async fn get_job(&self, id: Uuid, user_id: Uuid) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND user_id = $2");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_jobs(&self, user_id: Uuid) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE user_id = $1 AND archived_at IS NULL \
             ORDER BY created_at DESC"
        );
        let jobs = sqlx::query_as::<_, Job>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, user_id: Uuid, patch: JobPatch) -> Result<Option<Job>> {
        let sql = format!(
            "UPDATE jobs SET \
                 name = COALESCE($3, name), \
                 description = COALESCE($4, description), \
                 updated_at = NOW() \
             WHERE id = $1 AND user_id = $2 AND archived_at IS NULL \
             RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(&patch.name)
            .bind(&patch.description)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn set_job_status(
        &self,
        id: Uuid,
        user_id: Uuid,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let archived_at = (status == JobStatus::Archived).then_some(now);
        let sql = format!(
            "UPDATE jobs SET \
                 status = $3, \
                 archived_at = COALESCE($4, archived_at), \
                 updated_at = $5 \
             WHERE id = $1 AND user_id = $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(status)
            .bind(archived_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn add_endpoint(&self, endpoint: JobEndpoint) -> Result<JobEndpoint> {
        let sql = format!(
            "INSERT INTO job_endpoints ({ENDPOINT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29) \
             RETURNING {ENDPOINT_COLUMNS}"
        );
        let created = sqlx::query_as::<_, JobEndpoint>(&sql)
            .bind(endpoint.id)
            .bind(endpoint.job_id)
            .bind(endpoint.tenant_id)
            .bind(&endpoint.name)
            .bind(&endpoint.description)
            .bind(&endpoint.baseline_cron)
            .bind(endpoint.baseline_interval_ms)
            .bind(endpoint.min_interval_ms)
            .bind(endpoint.max_interval_ms)
            .bind(&endpoint.url)
            .bind(endpoint.method)
            .bind(&endpoint.headers_json)
            .bind(&endpoint.body_json)
            .bind(endpoint.timeout_ms)
            .bind(endpoint.max_execution_time_ms)
            .bind(endpoint.max_response_size_kb)
            .bind(endpoint.next_run_at)
            .bind(endpoint.last_run_at)
            .bind(endpoint.failure_count)
            .bind(endpoint.leased_until)
            .bind(&endpoint.lease_owner)
            .bind(endpoint.ai_hint_interval_ms)
            .bind(endpoint.ai_hint_next_run_at)
            .bind(endpoint.ai_hint_expires_at)
            .bind(&endpoint.ai_hint_reason)
            .bind(endpoint.paused_until)
            .bind(endpoint.archived_at)
            .bind(endpoint.created_at)
            .bind(endpoint.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(created)
    }

    async fn update_endpoint(
        &self,
        id: Uuid,
        user_id: Uuid,
        patch: EndpointPatch,
    ) -> Result<Option<JobEndpoint>> {
        let Some(mut endpoint) = self.get_endpoint_for_user(id, user_id).await? else {
            return Ok(None);
        };
        patch.apply(&mut endpoint);

        let sql = format!(
            "UPDATE job_endpoints SET \
                 name = $3, description = $4, \
                 baseline_cron = $5, baseline_interval_ms = $6, \
                 min_interval_ms = $7, max_interval_ms = $8, \
                 url = $9, method = $10, headers_json = $11, body_json = $12, \
                 timeout_ms = $13, max_execution_time_ms = $14, max_response_size_kb = $15, \
                 updated_at = NOW() \
             WHERE id = $1 AND tenant_id = $2 AND archived_at IS NULL \
             RETURNING {ENDPOINT_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, JobEndpoint>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(&endpoint.name)
            .bind(&endpoint.description)
            .bind(&endpoint.baseline_cron)
            .bind(endpoint.baseline_interval_ms)
            .bind(endpoint.min_interval_ms)
            .bind(endpoint.max_interval_ms)
            .bind(&endpoint.url)
            .bind(endpoint.method)
            .bind(&endpoint.headers_json)
            .bind(&endpoint.body_json)
            .bind(endpoint.timeout_ms)
            .bind(endpoint.max_execution_time_ms)
            .bind(endpoint.max_response_size_kb)
            .fetch_optional(&self.pool)
            .await?;
        Ok(updated)
    }

    async fn delete_endpoint(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_endpoints WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn archive_endpoint(&self, id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_endpoints \
             SET archived_at = $3, updated_at = $3 \
             WHERE id = $1 AND tenant_id = $2 AND archived_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<JobEndpoint>> {
        let sql = format!("SELECT {ENDPOINT_COLUMNS} FROM job_endpoints WHERE id = $1");
        let endpoint = sqlx::query_as::<_, JobEndpoint>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(endpoint)
    }

    async fn get_endpoint_for_user(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<JobEndpoint>> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM job_endpoints WHERE id = $1 AND tenant_id = $2"
        );
        let endpoint = sqlx::query_as::<_, JobEndpoint>(&sql)
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(endpoint)
    }

    async fn list_endpoints_by_job(
        &self,
        job_id: Uuid,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<JobEndpoint>> {
        let sql = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM job_endpoints \
             WHERE job_id = $1 AND tenant_id = $2 \
               AND ($3 OR archived_at IS NULL) \
             ORDER BY created_at ASC"
        );
        let endpoints = sqlx::query_as::<_, JobEndpoint>(&sql)
            .bind(job_id)
            .bind(user_id)
            .bind(include_archived)
            .fetch_all(&self.pool)
            .await?;
        Ok(endpoints)
    }

    async fn endpoint_counts(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<EndpointCounts> {
        let (total, active, paused) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT \
                 COUNT(*), \
                 COUNT(*) FILTER (WHERE j.status = 'active' \
                     AND (e.paused_until IS NULL OR e.paused_until <= $2)), \
                 COUNT(*) FILTER (WHERE j.status <> 'active' OR e.paused_until > $2) \
             FROM job_endpoints e \
             JOIN jobs j ON j.id = e.job_id \
             WHERE e.tenant_id = $1 AND e.archived_at IS NULL",
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(EndpointCounts {
            total,
            active,
            paused,
        })
    }

    async fn claim_due_endpoints(
        &self,
        batch_size: i64,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let leased_until = now + Duration::milliseconds(lease_ms);

        let mut tx = self.pool.begin().await.context("begin claim transaction")?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {CLAIM_TIMEOUT_MS}"))
            .execute(&mut *tx)
            .await?;

        let claimed = sqlx::query_scalar::<_, Uuid>(
            "WITH due AS ( \
                 SELECT e.id \
                 FROM job_endpoints e \
                 JOIN jobs j ON j.id = e.job_id \
                 WHERE e.archived_at IS NULL \
                   AND j.status = 'active' \
                   AND (e.paused_until IS NULL OR e.paused_until <= $1) \
                   AND e.next_run_at <= $1 \
                   AND (e.leased_until IS NULL OR e.leased_until <= $1) \
                 ORDER BY e.next_run_at ASC, e.id ASC \
                 LIMIT $2 \
                 FOR UPDATE OF e SKIP LOCKED \
             ) \
             UPDATE job_endpoints AS e \
             SET leased_until = $3, lease_owner = $4, updated_at = $1 \
             FROM due \
             WHERE e.id = due.id \
             RETURNING e.id",
        )
        .bind(now)
        .bind(batch_size)
        .bind(leased_until)
        .bind(owner)
        .fetch_all(&mut *tx)
        .await;

        match claimed {
            Ok(ids) => {
                tx.commit().await.context("commit claim transaction")?;
                Ok(ids)
            }
            Err(e) if Self::is_statement_timeout(&e) => {
                debug!("claim hit the contention budget, returning empty batch");
                let _ = tx.rollback().await;
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_lock(
        &self,
        id: Uuid,
        lease_ms: i64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_endpoints \
             SET leased_until = $2, lease_owner = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(now + Duration::milliseconds(lease_ms))
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_lock(&self, id: Uuid) -> Result<()> {
        with_retries("clear_lock", || async move {
            sqlx::query(
                "UPDATE job_endpoints \
                 SET leased_until = NULL, lease_owner = NULL, updated_at = NOW() \
                 WHERE id = $1",
            )
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await?;
        Ok(())
    }

    async fn set_next_run_at_if_earlier(&self, id: Uuid, t: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE job_endpoints \
             SET next_run_at = $2, updated_at = NOW() \
             WHERE id = $1 AND next_run_at > $2 AND archived_at IS NULL",
        )
        .bind(id)
        .bind(t)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_ai_hint(&self, id: Uuid, hint: AiHint) -> Result<()> {
        sqlx::query(
            "UPDATE job_endpoints SET \
                 ai_hint_interval_ms = $2, \
                 ai_hint_next_run_at = $3, \
                 ai_hint_expires_at = $4, \
                 ai_hint_reason = $5, \
                 updated_at = NOW() \
             WHERE id = $1 AND archived_at IS NULL",
        )
        .bind(id)
        .bind(hint.interval_ms)
        .bind(hint.next_run_at)
        .bind(hint.expires_at)
        .bind(&hint.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_ai_hints(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE job_endpoints SET \
                 ai_hint_interval_ms = NULL, \
                 ai_hint_next_run_at = NULL, \
                 ai_hint_expires_at = NULL, \
                 ai_hint_reason = NULL, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_expired_ai_hints(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE job_endpoints SET \
                 ai_hint_interval_ms = NULL, \
                 ai_hint_next_run_at = NULL, \
                 ai_hint_expires_at = NULL, \
                 ai_hint_reason = NULL, \
                 updated_at = $1 \
             WHERE ai_hint_expires_at IS NOT NULL AND ai_hint_expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_paused_until(
        &self,
        id: Uuid,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match until {
            Some(until) => {
                sqlx::query(
                    "UPDATE job_endpoints \
                     SET paused_until = $2, updated_at = $3 \
                     WHERE id = $1 AND archived_at IS NULL",
                )
                .bind(id)
                .bind(until)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            None => {
                // Resume schedules a near-term run so the next tick picks the
                // endpoint up without waiting out the old schedule.
                sqlx::query(
                    "UPDATE job_endpoints \
                     SET paused_until = NULL, \
                         next_run_at = LEAST(next_run_at, $2), \
                         updated_at = $3 \
                     WHERE id = $1 AND archived_at IS NULL",
                )
                .bind(id)
                .bind(now + Duration::seconds(1))
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn reset_failure_count(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE job_endpoints SET failure_count = 0, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_after_run(&self, id: Uuid, update: AfterRun) -> Result<()> {
        with_retries("update_after_run", || {
            let update = update.clone();
            async move {
                sqlx::query(
                    "UPDATE job_endpoints SET \
                         last_run_at = $2, \
                         failure_count = $3, \
                         next_run_at = $4, \
                         paused_until = COALESCE($5, paused_until), \
                         ai_hint_next_run_at = CASE WHEN $6 OR $7 THEN NULL \
                             ELSE ai_hint_next_run_at END, \
                         ai_hint_interval_ms = CASE WHEN $7 THEN NULL \
                             ELSE ai_hint_interval_ms END, \
                         ai_hint_expires_at = CASE WHEN $7 THEN NULL \
                             ELSE ai_hint_expires_at END, \
                         ai_hint_reason = CASE WHEN $7 THEN NULL \
                             ELSE ai_hint_reason END, \
                         leased_until = NULL, \
                         lease_owner = NULL, \
                         updated_at = NOW() \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(update.last_run_at)
                .bind(update.failure_count)
                .bind(update.next_run_at)
                .bind(update.paused_until)
                .bind(update.clear_hint_next_run)
                .bind(update.clear_expired_hints)
                .execute(&self.pool)
                .await
                .map(|_| ())
            }
        })
        .await?;
        Ok(())
    }

    async fn earliest_next_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let earliest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(e.next_run_at) \
             FROM job_endpoints e \
             JOIN jobs j ON j.id = e.job_id \
             WHERE e.archived_at IS NULL \
               AND j.status = 'active' \
               AND (e.paused_until IS NULL OR e.paused_until <= $1) \
               AND (e.leased_until IS NULL OR e.leased_until <= $1)",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(earliest)
    }
}

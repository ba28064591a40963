//! Run history: dispatch attempts, outcomes, and the aggregate read surface
//! feeding dashboards and the planner.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db::with_retries;
use crate::common::pagination::{Page, PageArgs};
use crate::kernel::dispatcher::Outcome;
use super::models::{Run, RunSource, RunStatus};

const RUN_COLUMNS: &str = "id, endpoint_id, status, attempt, source, started_at, finished_at, \
     duration_ms, status_code, error_message, response_body";

/// Filters for run listings. `user_id` is mandatory: history reads are always
/// scoped to the owning user.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub user_id: Uuid,
    pub endpoint_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub status: Option<RunStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct MetricsFilter {
    pub user_id: Uuid,
    pub job_id: Option<Uuid>,
    pub source: Option<RunSource>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub timeout: i64,
    pub avg_duration_ms: Option<f64>,
}

/// Aggregation bucket width for time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
}

impl Granularity {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }
}

/// One time-series bucket of run counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunBucket {
    pub bucket: DateTime<Utc>,
    pub success: i64,
    pub failure: i64,
}

/// One (bucket, endpoint) cell of the per-endpoint series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointBucket {
    pub bucket: DateTime<Utc>,
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub success: i64,
    pub failure: i64,
    pub total_duration_ms: i64,
}

/// Rolled-up health of one endpoint over a trailing window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub success_count: i64,
    pub failure_count: i64,
    pub avg_duration_ms: Option<f64>,
    pub last_run: Option<Run>,
    pub failure_streak: i64,
}

/// The response-oriented view of a finished run, for the planner.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseSnapshot {
    pub run_id: Uuid,
    pub endpoint_id: Uuid,
    pub status: RunStatus,
    pub status_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
    pub response_body: Option<serde_json::Value>,
}

/// Latest response of an endpoint sharing the same job.
#[derive(Debug, Clone, Serialize)]
pub struct SiblingResponse {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub latest: Option<ResponseSnapshot>,
}

/// Storage contract for run attempts and their aggregates.
#[async_trait]
pub trait RunsRepo: Send + Sync {
    /// Create a provisional run row right before dispatch. The status starts
    /// as `failed` so a crashed worker leaves behind an honest record.
    async fn create(
        &self,
        endpoint_id: Uuid,
        started_at: DateTime<Utc>,
        source: RunSource,
        attempt: i32,
    ) -> Result<Uuid>;

    /// Finalize a run exactly once with its outcome and the governor-chosen
    /// source label. Finished runs are never touched again.
    async fn finish(
        &self,
        run_id: Uuid,
        outcome: &Outcome,
        source: RunSource,
        finished_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn list_runs(&self, filter: &RunFilter, page: PageArgs) -> Result<Page<Run>>;
    async fn get_run_details(&self, run_id: Uuid, user_id: Uuid) -> Result<Option<Run>>;
    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        window_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<HealthSummary>;

    // Planner-facing read surface.
    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>>;
    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ResponseSnapshot>>;
    async fn get_sibling_latest_responses(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<SiblingResponse>>;

    async fn get_filtered_metrics(&self, filter: &MetricsFilter) -> Result<RunMetrics>;
    async fn get_run_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<RunBucket>>;
    async fn get_endpoint_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<EndpointBucket>>;

    /// Finalize provisional runs whose worker died: anything still unfinished
    /// after the threshold becomes a `timeout` with a sentinel message.
    async fn cleanup_zombie_runs(&self, threshold_ms: i64, now: DateTime<Utc>) -> Result<u64>;

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<i64>;
    async fn count_for_job(&self, job_id: Uuid) -> Result<i64>;
}

/// Sentinel recorded on zombie-reconciled runs.
pub const ZOMBIE_ERROR_MESSAGE: &str = "run abandoned by worker; reconciled as timeout";

/// PostgreSQL-backed implementation.
pub struct PostgresRunsRepo {
    pool: PgPool,
}

impl PostgresRunsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunsRepo for PostgresRunsRepo {
    async fn create(
        &self,
        endpoint_id: Uuid,
        started_at: DateTime<Utc>,
        source: RunSource,
        attempt: i32,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        with_retries("run_create", || async move {
            sqlx::query(
                "INSERT INTO runs (id, endpoint_id, status, attempt, source, started_at) \
                 VALUES ($1, $2, 'failed', $3, $4, $5)",
            )
            .bind(id)
            .bind(endpoint_id)
            .bind(attempt)
            .bind(source.as_str())
            .bind(started_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await?;
        Ok(id)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        outcome: &Outcome,
        source: RunSource,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        with_retries("run_finish", || async move {
            sqlx::query(
                "UPDATE runs SET \
                     status = $2, source = $3, finished_at = $4, duration_ms = $5, \
                     status_code = $6, error_message = $7, response_body = $8 \
                 WHERE id = $1 AND finished_at IS NULL",
            )
            .bind(run_id)
            .bind(outcome.run_status())
            .bind(source.as_str())
            .bind(finished_at)
            .bind(outcome.duration_ms())
            .bind(outcome.status_code())
            .bind(outcome.error_message())
            .bind(outcome.response_body())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await?;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter, page: PageArgs) -> Result<Page<Run>> {
        let where_clause = "e.tenant_id = $1 \
             AND ($2::uuid IS NULL OR r.endpoint_id = $2) \
             AND ($3::uuid IS NULL OR e.job_id = $3) \
             AND ($4::run_status IS NULL OR r.status = $4) \
             AND ($5::timestamptz IS NULL OR r.started_at >= $5) \
             AND ($6::timestamptz IS NULL OR r.started_at <= $6)";

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE {where_clause}"
        ))
        .bind(filter.user_id)
        .bind(filter.endpoint_id)
        .bind(filter.job_id)
        .bind(filter.status)
        .bind(filter.since)
        .bind(filter.until)
        .fetch_one(&self.pool)
        .await?;

        let select_columns = RUN_COLUMNS
            .split(", ")
            .map(|c| format!("r.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let items = sqlx::query_as::<_, Run>(&format!(
            "SELECT {select_columns} FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE {where_clause} \
             ORDER BY r.started_at DESC \
             LIMIT $7 OFFSET $8"
        ))
        .bind(filter.user_id)
        .bind(filter.endpoint_id)
        .bind(filter.job_id)
        .bind(filter.status)
        .bind(filter.since)
        .bind(filter.until)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(Page { items, total })
    }

    async fn get_run_details(&self, run_id: Uuid, user_id: Uuid) -> Result<Option<Run>> {
        let select_columns = RUN_COLUMNS
            .split(", ")
            .map(|c| format!("r.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let run = sqlx::query_as::<_, Run>(&format!(
            "SELECT {select_columns} FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE r.id = $1 AND e.tenant_id = $2"
        ))
        .bind(run_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(run)
    }

    async fn get_health_summary(
        &self,
        endpoint_id: Uuid,
        window_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<HealthSummary> {
        let since = now - Duration::milliseconds(window_ms);

        let (success_count, failure_count, avg_duration_ms) =
            sqlx::query_as::<_, (i64, i64, Option<f64>)>(
                "SELECT \
                     COUNT(*) FILTER (WHERE status = 'success'), \
                     COUNT(*) FILTER (WHERE status <> 'success'), \
                     AVG(duration_ms)::FLOAT8 \
                 FROM runs \
                 WHERE endpoint_id = $1 AND finished_at IS NOT NULL AND started_at >= $2",
            )
            .bind(endpoint_id)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        let last_run = sqlx::query_as::<_, Run>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE endpoint_id = $1 AND finished_at IS NOT NULL \
             ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        // Consecutive non-success runs since the last success.
        let failure_streak = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM runs \
             WHERE endpoint_id = $1 \
               AND finished_at IS NOT NULL \
               AND status <> 'success' \
               AND started_at > COALESCE( \
                   (SELECT MAX(started_at) FROM runs \
                    WHERE endpoint_id = $1 AND status = 'success'), \
                   '-infinity'::timestamptz)",
        )
        .bind(endpoint_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(HealthSummary {
            success_count,
            failure_count,
            avg_duration_ms,
            last_run,
            failure_streak,
        })
    }

    async fn get_latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>> {
        let snapshots = self.get_response_history(endpoint_id, 1).await?;
        Ok(snapshots.into_iter().next())
    }

    async fn get_response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ResponseSnapshot>> {
        let rows = sqlx::query_as::<
            _,
            (Uuid, Uuid, RunStatus, Option<i32>, Option<DateTime<Utc>>, Option<serde_json::Value>),
        >(
            "SELECT id, endpoint_id, status, status_code, finished_at, response_body \
             FROM runs \
             WHERE endpoint_id = $1 AND finished_at IS NOT NULL \
             ORDER BY started_at DESC \
             LIMIT $2",
        )
        .bind(endpoint_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(run_id, endpoint_id, status, status_code, finished_at, response_body)| {
                    ResponseSnapshot {
                        run_id,
                        endpoint_id,
                        status,
                        status_code,
                        finished_at,
                        response_body,
                    }
                },
            )
            .collect())
    }

    async fn get_sibling_latest_responses(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<SiblingResponse>> {
        let rows = sqlx::query_as::<
            _,
            (
                Uuid,
                String,
                Option<Uuid>,
                Option<RunStatus>,
                Option<i32>,
                Option<DateTime<Utc>>,
                Option<serde_json::Value>,
            ),
        >(
            "SELECT e.id, e.name, r.id, r.status, r.status_code, r.finished_at, r.response_body \
             FROM job_endpoints e \
             LEFT JOIN LATERAL ( \
                 SELECT id, status, status_code, finished_at, response_body \
                 FROM runs \
                 WHERE endpoint_id = e.id AND finished_at IS NOT NULL \
                 ORDER BY started_at DESC LIMIT 1 \
             ) r ON TRUE \
             WHERE e.job_id = (SELECT job_id FROM job_endpoints WHERE id = $1) \
               AND e.id <> $1 \
               AND e.archived_at IS NULL \
             ORDER BY e.created_at ASC",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(sibling_id, name, run_id, status, status_code, finished_at, body)| {
                    let latest = match (run_id, status) {
                        (Some(run_id), Some(status)) => Some(ResponseSnapshot {
                            run_id,
                            endpoint_id: sibling_id,
                            status,
                            status_code,
                            finished_at,
                            response_body: body,
                        }),
                        _ => None,
                    };
                    SiblingResponse {
                        endpoint_id: sibling_id,
                        endpoint_name: name,
                        latest,
                    }
                },
            )
            .collect())
    }

    async fn get_filtered_metrics(&self, filter: &MetricsFilter) -> Result<RunMetrics> {
        let (total, success, failure, timeout, avg_duration_ms) = sqlx::query_as::<
            _,
            (i64, i64, i64, i64, Option<f64>),
        >(
            "SELECT \
                 COUNT(*), \
                 COUNT(*) FILTER (WHERE r.status = 'success'), \
                 COUNT(*) FILTER (WHERE r.status = 'failed'), \
                 COUNT(*) FILTER (WHERE r.status = 'timeout'), \
                 AVG(r.duration_ms)::FLOAT8 \
             FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE e.tenant_id = $1 \
               AND ($2::uuid IS NULL OR e.job_id = $2) \
               AND ($3::text IS NULL OR r.source = $3) \
               AND r.started_at >= $4 AND r.started_at <= $5",
        )
        .bind(filter.user_id)
        .bind(filter.job_id)
        .bind(filter.source.map(|s| s.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .fetch_one(&self.pool)
        .await?;

        Ok(RunMetrics {
            total,
            success,
            failure,
            timeout,
            avg_duration_ms,
        })
    }

    async fn get_run_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<RunBucket>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, i64, i64)>(
            "SELECT \
                 date_trunc($4, r.started_at) AS bucket, \
                 COUNT(*) FILTER (WHERE r.status = 'success'), \
                 COUNT(*) FILTER (WHERE r.status <> 'success') \
             FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE e.tenant_id = $1 AND r.started_at >= $2 AND r.started_at <= $3 \
             GROUP BY bucket \
             ORDER BY bucket ASC",
        )
        .bind(user_id)
        .bind(since)
        .bind(until)
        .bind(granularity.as_sql())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(bucket, success, failure)| RunBucket {
                bucket,
                success,
                failure,
            })
            .collect())
    }

    async fn get_endpoint_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<EndpointBucket>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, Uuid, String, i64, i64, Option<i64>)>(
            "SELECT \
                 date_trunc($4, r.started_at) AS bucket, \
                 e.id, e.name, \
                 COUNT(*) FILTER (WHERE r.status = 'success'), \
                 COUNT(*) FILTER (WHERE r.status <> 'success'), \
                 SUM(r.duration_ms)::BIGINT \
             FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE e.tenant_id = $1 AND r.started_at >= $2 AND r.started_at <= $3 \
             GROUP BY bucket, e.id, e.name \
             ORDER BY bucket ASC",
        )
        .bind(user_id)
        .bind(since)
        .bind(until)
        .bind(granularity.as_sql())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(bucket, endpoint_id, endpoint_name, success, failure, duration)| EndpointBucket {
                    bucket,
                    endpoint_id,
                    endpoint_name,
                    success,
                    failure,
                    total_duration_ms: duration.unwrap_or(0),
                },
            )
            .collect())
    }

    async fn cleanup_zombie_runs(&self, threshold_ms: i64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::milliseconds(threshold_ms);
        let result = sqlx::query(
            "UPDATE runs SET \
                 status = 'timeout', \
                 finished_at = $1, \
                 duration_ms = (EXTRACT(EPOCH FROM ($1 - started_at)) * 1000)::BIGINT, \
                 error_message = $2 \
             WHERE finished_at IS NULL AND started_at < $3",
        )
        .bind(now)
        .bind(ZOMBIE_ERROR_MESSAGE)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM runs WHERE endpoint_id = $1")
            .bind(endpoint_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_for_job(&self, job_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM runs r \
             JOIN job_endpoints e ON e.id = r.endpoint_id \
             WHERE e.job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

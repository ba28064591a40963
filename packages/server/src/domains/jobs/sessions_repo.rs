//! Planner analysis session store. Append-only.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::AnalysisSession;
use super::runs_repo::Granularity;

const SESSION_COLUMNS: &str = "id, endpoint_id, analyzed_at, reasoning, tool_calls, \
     token_usage, duration_ms, next_analysis_at";

/// One time-series bucket of planner activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionBucket {
    pub bucket: DateTime<Utc>,
    pub sessions: i64,
}

#[async_trait]
pub trait SessionsRepo: Send + Sync {
    async fn record_session(&self, session: AnalysisSession) -> Result<AnalysisSession>;
    async fn list_sessions(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<AnalysisSession>>;
    async fn latest_session(&self, endpoint_id: Uuid) -> Result<Option<AnalysisSession>>;
    async fn session_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<SessionBucket>>;
}

/// PostgreSQL-backed implementation.
pub struct PostgresSessionsRepo {
    pool: PgPool,
}

impl PostgresSessionsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionsRepo for PostgresSessionsRepo {
    async fn record_session(&self, session: AnalysisSession) -> Result<AnalysisSession> {
        let sql = format!(
            "INSERT INTO ai_analysis_sessions ({SESSION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {SESSION_COLUMNS}"
        );
        let recorded = sqlx::query_as::<_, AnalysisSession>(&sql)
            .bind(session.id)
            .bind(session.endpoint_id)
            .bind(session.analyzed_at)
            .bind(&session.reasoning)
            .bind(&session.tool_calls)
            .bind(session.token_usage)
            .bind(session.duration_ms)
            .bind(session.next_analysis_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(recorded)
    }

    async fn list_sessions(&self, endpoint_id: Uuid, limit: i64) -> Result<Vec<AnalysisSession>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM ai_analysis_sessions \
             WHERE endpoint_id = $1 \
             ORDER BY analyzed_at DESC \
             LIMIT $2"
        );
        let sessions = sqlx::query_as::<_, AnalysisSession>(&sql)
            .bind(endpoint_id)
            .bind(limit.max(1))
            .fetch_all(&self.pool)
            .await?;
        Ok(sessions)
    }

    async fn latest_session(&self, endpoint_id: Uuid) -> Result<Option<AnalysisSession>> {
        let sessions = self.list_sessions(endpoint_id, 1).await?;
        Ok(sessions.into_iter().next())
    }

    async fn session_time_series(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<Vec<SessionBucket>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, i64)>(
            "SELECT date_trunc($4, s.analyzed_at) AS bucket, COUNT(*) \
             FROM ai_analysis_sessions s \
             JOIN job_endpoints e ON e.id = s.endpoint_id \
             WHERE e.tenant_id = $1 AND s.analyzed_at >= $2 AND s.analyzed_at <= $3 \
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
            .map(|(bucket, sessions)| SessionBucket { bucket, sessions })
            .collect())
    }
}

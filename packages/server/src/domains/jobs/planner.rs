//! The narrow write/read surface exposed to the external AI planner.
//!
//! The planner is system-side: it addresses endpoints directly and its writes
//! are idempotent latest-write-wins hint updates. Everything else about the
//! planner (prompting, tool loops, model calls) lives outside the core; the
//! traces it produces come back in through [`SessionsRepo::record_session`].

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::common::clock::Clock;
use super::jobs_repo::JobsRepo;
use super::models::{AiHint, AnalysisSession};
use super::runs_repo::{HealthSummary, ResponseSnapshot, RunsRepo, SiblingResponse};
use super::sessions_repo::SessionsRepo;

/// Acknowledgement returned by every planner write.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HintAck {
    pub ok: bool,
}

/// Interval suggestion from the planner.
#[derive(Debug, Clone)]
pub struct ProposeInterval {
    pub interval_ms: i64,
    pub ttl_minutes: i64,
    pub reason: Option<String>,
}

/// One-shot fire-time suggestion. Either an offset from now or an absolute
/// instant; the offset wins when both are present.
#[derive(Debug, Clone)]
pub struct ProposeNextTime {
    pub next_run_in_ms: Option<i64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub ttl_minutes: i64,
    pub reason: Option<String>,
}

pub struct PlannerGateway {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    sessions: Arc<dyn SessionsRepo>,
    clock: Arc<dyn Clock>,
}

impl PlannerGateway {
    pub fn new(
        jobs: Arc<dyn JobsRepo>,
        runs: Arc<dyn RunsRepo>,
        sessions: Arc<dyn SessionsRepo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            runs,
            sessions,
            clock,
        }
    }

    async fn endpoint_is_live(&self, endpoint_id: Uuid) -> Result<bool> {
        Ok(self
            .jobs
            .get_endpoint(endpoint_id)
            .await?
            .is_some_and(|e| e.archived_at.is_none()))
    }

    pub async fn propose_interval(
        &self,
        endpoint_id: Uuid,
        proposal: ProposeInterval,
    ) -> Result<HintAck> {
        if proposal.interval_ms <= 0 || proposal.ttl_minutes <= 0 {
            return Ok(HintAck { ok: false });
        }
        if !self.endpoint_is_live(endpoint_id).await? {
            return Ok(HintAck { ok: false });
        }
        let now = self.clock.now();
        let hint = AiHint {
            interval_ms: Some(proposal.interval_ms),
            next_run_at: None,
            expires_at: now + Duration::minutes(proposal.ttl_minutes),
            reason: proposal.reason,
        };
        self.jobs.write_ai_hint(endpoint_id, hint).await?;
        self.jobs
            .set_next_run_at_if_earlier(
                endpoint_id,
                now + Duration::milliseconds(proposal.interval_ms),
            )
            .await?;
        info!(endpoint_id = %endpoint_id, interval_ms = proposal.interval_ms, "planner proposed interval");
        Ok(HintAck { ok: true })
    }

    pub async fn propose_next_time(
        &self,
        endpoint_id: Uuid,
        proposal: ProposeNextTime,
    ) -> Result<HintAck> {
        let now = self.clock.now();
        let next_run_at = match (proposal.next_run_in_ms, proposal.next_run_at) {
            (Some(offset_ms), _) if offset_ms >= 0 => now + Duration::milliseconds(offset_ms),
            (None, Some(at)) => at,
            _ => return Ok(HintAck { ok: false }),
        };
        if proposal.ttl_minutes <= 0 || !self.endpoint_is_live(endpoint_id).await? {
            return Ok(HintAck { ok: false });
        }
        let hint = AiHint {
            interval_ms: None,
            next_run_at: Some(next_run_at),
            expires_at: now + Duration::minutes(proposal.ttl_minutes),
            reason: proposal.reason,
        };
        self.jobs.write_ai_hint(endpoint_id, hint).await?;
        self.jobs
            .set_next_run_at_if_earlier(endpoint_id, next_run_at.max(now))
            .await?;
        info!(endpoint_id = %endpoint_id, next_run_at = %next_run_at, "planner proposed one-shot");
        Ok(HintAck { ok: true })
    }

    pub async fn pause_until(
        &self,
        endpoint_id: Uuid,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<HintAck> {
        if !self.endpoint_is_live(endpoint_id).await? {
            return Ok(HintAck { ok: false });
        }
        self.jobs
            .set_paused_until(endpoint_id, until, self.clock.now())
            .await?;
        info!(
            endpoint_id = %endpoint_id,
            until = ?until,
            reason = reason.as_deref().unwrap_or("-"),
            "planner pause update"
        );
        Ok(HintAck { ok: true })
    }

    pub async fn record_session(&self, session: AnalysisSession) -> Result<AnalysisSession> {
        self.sessions.record_session(session).await
    }

    // Read surface.

    pub async fn latest_response(&self, endpoint_id: Uuid) -> Result<Option<ResponseSnapshot>> {
        self.runs.get_latest_response(endpoint_id).await
    }

    pub async fn response_history(
        &self,
        endpoint_id: Uuid,
        limit: i64,
    ) -> Result<Vec<ResponseSnapshot>> {
        self.runs.get_response_history(endpoint_id, limit).await
    }

    pub async fn sibling_latest_responses(
        &self,
        endpoint_id: Uuid,
    ) -> Result<Vec<SiblingResponse>> {
        self.runs.get_sibling_latest_responses(endpoint_id).await
    }

    pub async fn health_summary(
        &self,
        endpoint_id: Uuid,
        window_ms: i64,
    ) -> Result<HealthSummary> {
        self.runs
            .get_health_summary(endpoint_id, window_ms, self.clock.now())
            .await
    }
}

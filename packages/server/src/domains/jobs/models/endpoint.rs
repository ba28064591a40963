//! Endpoint model: the unit the scheduler fires.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Dispatch timeout applied when the endpoint does not configure one.
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;

/// Absolute ceiling on any dispatch timeout.
pub const MAX_TIMEOUT_MS: i64 = 60_000;

/// Failure streaks are capped here to bound backoff growth.
pub const MAX_FAILURE_COUNT: i32 = 64;

/// Backoff base for cron-baseline endpoints, which have no natural interval.
pub const CRON_BACKOFF_BASE_MS: i64 = 60_000;

/// Sentinel for endpoints parked until a human intervenes.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "http_method", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unsupported method: {other}")),
        }
    }
}

/// The user-configured default cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline<'a> {
    Cron(&'a str),
    IntervalMs(i64),
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobEndpoint {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,

    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,

    // Baseline cadence: exactly one of the two is set.
    #[builder(default, setter(strip_option))]
    pub baseline_cron: Option<String>,
    #[builder(default, setter(strip_option))]
    pub baseline_interval_ms: Option<i64>,

    // Guardrails clamping any hint.
    #[builder(default, setter(strip_option))]
    pub min_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_interval_ms: Option<i64>,

    // HTTP config.
    pub url: String,
    #[builder(default)]
    pub method: HttpMethod,
    #[builder(default = Json(BTreeMap::new()))]
    pub headers_json: Json<BTreeMap<String, String>>,
    #[builder(default, setter(strip_option))]
    pub body_json: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_execution_time_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub max_response_size_kb: Option<i64>,

    // Runtime state.
    pub next_run_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub failure_count: i32,

    // Claim lease. A live lease means exactly one worker owns this endpoint.
    #[builder(default, setter(strip_option))]
    pub leased_until: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lease_owner: Option<String>,

    // Planner hints, only honored while fresh.
    #[builder(default, setter(strip_option))]
    pub ai_hint_interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub ai_hint_reason: Option<String>,

    #[builder(default, setter(strip_option))]
    pub paused_until: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub archived_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl JobEndpoint {
    /// The configured baseline cadence.
    ///
    /// Validation guarantees exactly one kind is present; a row violating that
    /// is treated as a one-minute interval rather than crashing the loop.
    pub fn baseline(&self) -> Baseline<'_> {
        match (&self.baseline_cron, self.baseline_interval_ms) {
            (Some(cron), _) => Baseline::Cron(cron),
            (None, Some(ms)) => Baseline::IntervalMs(ms),
            (None, None) => Baseline::IntervalMs(CRON_BACKOFF_BASE_MS),
        }
    }

    /// Base interval used for failure backoff growth.
    pub fn base_interval_ms(&self) -> i64 {
        self.baseline_interval_ms.unwrap_or(CRON_BACKOFF_BASE_MS)
    }

    /// Whether the stored AI hint may influence scheduling at `now`.
    pub fn hint_is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.ai_hint_expires_at.is_some_and(|exp| exp > now)
    }

    /// Whether any hint fields are populated.
    pub fn has_hint(&self) -> bool {
        self.ai_hint_interval_ms.is_some()
            || self.ai_hint_next_run_at.is_some()
            || self.ai_hint_expires_at.is_some()
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| until > now)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }

    /// Claim eligibility at `now`, ignoring the parent job's status.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.archived_at.is_none()
            && !self.is_paused(now)
            && self.next_run_at <= now
            && !self.is_leased(now)
    }

    /// Hard dispatch timeout: configured value bounded by the execution cap
    /// and the absolute ceiling.
    pub fn effective_timeout_ms(&self) -> i64 {
        let configured = self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        let execution_cap = self.max_execution_time_ms.unwrap_or(MAX_TIMEOUT_MS);
        configured.min(execution_cap).min(MAX_TIMEOUT_MS).max(1)
    }

    /// Lease long enough to cover a full dispatch plus margin.
    pub fn lease_ms(&self, margin_ms: i64) -> i64 {
        self.effective_timeout_ms() * 2 + margin_ms
    }
}

/// Counts surfaced to quota checks and dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointCounts {
    pub total: i64,
    pub active: i64,
    pub paused: i64,
}

/// Partial update for endpoint configuration; `None` fields are untouched.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
pub struct EndpointPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub baseline_cron: Option<String>,
    pub baseline_interval_ms: Option<i64>,
    pub min_interval_ms: Option<i64>,
    pub max_interval_ms: Option<i64>,
    pub url: Option<String>,
    pub method: Option<HttpMethod>,
    pub headers_json: Option<BTreeMap<String, String>>,
    pub body_json: Option<serde_json::Value>,
    pub timeout_ms: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
    pub max_response_size_kb: Option<i64>,
}

impl EndpointPatch {
    /// Merge this patch into an endpoint snapshot.
    ///
    /// Setting one baseline kind clears the other so the exactly-one
    /// invariant survives a cadence switch.
    pub fn apply(self, endpoint: &mut JobEndpoint) {
        if let Some(name) = self.name {
            endpoint.name = name;
        }
        if let Some(description) = self.description {
            endpoint.description = Some(description);
        }
        if let Some(cron) = self.baseline_cron {
            endpoint.baseline_cron = Some(cron);
            endpoint.baseline_interval_ms = None;
        }
        if let Some(interval) = self.baseline_interval_ms {
            endpoint.baseline_interval_ms = Some(interval);
            endpoint.baseline_cron = None;
        }
        if let Some(min) = self.min_interval_ms {
            endpoint.min_interval_ms = Some(min);
        }
        if let Some(max) = self.max_interval_ms {
            endpoint.max_interval_ms = Some(max);
        }
        if let Some(url) = self.url {
            endpoint.url = url;
        }
        if let Some(method) = self.method {
            endpoint.method = method;
        }
        if let Some(headers) = self.headers_json {
            endpoint.headers_json = Json(headers);
        }
        if let Some(body) = self.body_json {
            endpoint.body_json = Some(body);
        }
        if let Some(timeout) = self.timeout_ms {
            endpoint.timeout_ms = Some(timeout);
        }
        if let Some(cap) = self.max_execution_time_ms {
            endpoint.max_execution_time_ms = Some(cap);
        }
        if let Some(kb) = self.max_response_size_kb {
            endpoint.max_response_size_kb = Some(kb);
        }
    }
}

/// A planner hint write; overwrites whatever hint was stored before.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AiHint {
    #[builder(default, setter(strip_option))]
    pub interval_ms: Option<i64>,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub reason: Option<String>,
}

/// Atomic post-run write applied together with the lease release.
#[derive(Debug, Clone)]
pub struct AfterRun {
    pub last_run_at: DateTime<Utc>,
    pub failure_count: i32,
    pub next_run_at: DateTime<Utc>,
    /// `Some` parks or re-pauses the endpoint; `None` leaves the field alone.
    pub paused_until: Option<DateTime<Utc>>,
    /// Consume a one-shot hint that just fired.
    pub clear_hint_next_run: bool,
    /// Lazily drop a hint observed to be expired.
    pub clear_expired_hints: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_endpoint() -> JobEndpoint {
        JobEndpoint::builder()
            .job_id(Uuid::new_v4())
            .tenant_id(Uuid::new_v4())
            .name("health probe")
            .url("https://example.com/health")
            .baseline_interval_ms(60_000i64)
            .next_run_at(Utc::now())
            .build()
    }

    #[test]
    fn effective_timeout_honors_ceiling() {
        let mut endpoint = sample_endpoint();
        endpoint.timeout_ms = Some(600_000);
        assert_eq!(endpoint.effective_timeout_ms(), MAX_TIMEOUT_MS);
    }

    #[test]
    fn effective_timeout_honors_execution_cap() {
        let mut endpoint = sample_endpoint();
        endpoint.timeout_ms = Some(30_000);
        endpoint.max_execution_time_ms = Some(5_000);
        assert_eq!(endpoint.effective_timeout_ms(), 5_000);
    }

    #[test]
    fn hint_freshness_is_strict() {
        let now = Utc::now();
        let mut endpoint = sample_endpoint();

        endpoint.ai_hint_expires_at = Some(now);
        assert!(!endpoint.hint_is_fresh(now));

        endpoint.ai_hint_expires_at = Some(now + chrono::Duration::seconds(1));
        assert!(endpoint.hint_is_fresh(now));
    }

    #[test]
    fn expired_lease_does_not_block_claims() {
        let now = Utc::now();
        let mut endpoint = sample_endpoint();
        endpoint.next_run_at = now - chrono::Duration::seconds(5);
        endpoint.leased_until = Some(now - chrono::Duration::seconds(1));

        assert!(endpoint.is_claimable(now));
    }

    #[test]
    fn paused_endpoint_is_not_claimable() {
        let now = Utc::now();
        let mut endpoint = sample_endpoint();
        endpoint.next_run_at = now - chrono::Duration::seconds(5);
        endpoint.paused_until = Some(now + chrono::Duration::hours(1));

        assert!(!endpoint.is_claimable(now));
    }
}

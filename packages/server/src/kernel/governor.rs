//! Next-run decisions.
//!
//! The governor is a pure function over an endpoint snapshot, the outcome of
//! the run that just finished, and the current instant. It owns the rule
//! order: pause takeover, failure backoff, fresh one-shot hint, fresh interval
//! hint, baseline, then guardrail clamping. The returned source label is
//! attached to the just-finalized run.

use chrono::{DateTime, Duration, Utc};

use crate::domains::jobs::models::{Baseline, JobEndpoint, RunSource, MAX_FAILURE_COUNT};
use crate::kernel::cron::{self, CronError};

/// Backoff never exceeds this unless the endpoint's own max interval is wider.
pub const BACKOFF_CEILING_MS: i64 = 3_600_000;

/// Exponent cap: growth stops doubling after ten consecutive failures.
const BACKOFF_SHIFT_CAP: i32 = 10;

/// A scheduling decision plus the lifecycle side-effects to persist with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub next_run_at: DateTime<Utc>,
    pub failure_count: i32,
    pub source: RunSource,
    /// The one-shot hint fired and must be consumed.
    pub clear_hint_next_run: bool,
    /// A stored hint was observed expired and should be dropped.
    pub clear_expired_hints: bool,
}

/// Compute the endpoint's next fire time after a run.
///
/// Fails only when a cron baseline has no occurrence inside the safety
/// horizon; the caller parks the endpoint in that case.
pub fn plan_next(
    endpoint: &JobEndpoint,
    success: bool,
    now: DateTime<Utc>,
) -> Result<Decision, CronError> {
    let clear_expired_hints = endpoint.has_hint() && !endpoint.hint_is_fresh(now);

    // Pause takeover: an active pause owns the next fire time outright.
    if let Some(paused_until) = endpoint.paused_until {
        if paused_until > now {
            return Ok(Decision {
                next_run_at: paused_until.max(now + Duration::seconds(1)),
                failure_count: endpoint.failure_count,
                source: RunSource::BaselineInterval,
                clear_hint_next_run: false,
                clear_expired_hints,
            });
        }
    }

    // Failure backoff. Hints are never consulted here: a failing endpoint
    // relaxes to baseline pacing instead of compounding a tight hint.
    if !success {
        let failure_count = (endpoint.failure_count + 1).min(MAX_FAILURE_COUNT);
        let shift = failure_count.min(BACKOFF_SHIFT_CAP) as u32;
        let raw = endpoint.base_interval_ms().saturating_mul(1i64 << shift);
        let ceiling = endpoint.max_interval_ms.unwrap_or(0).max(BACKOFF_CEILING_MS);
        let backoff_ms = raw.min(ceiling);

        return Ok(Decision {
            next_run_at: now + Duration::milliseconds(backoff_ms),
            failure_count,
            source: RunSource::BaselineInterval,
            clear_hint_next_run: false,
            clear_expired_hints,
        });
    }

    let fresh = endpoint.hint_is_fresh(now);
    let one_shot = endpoint
        .ai_hint_next_run_at
        .filter(|t| fresh && *t > now);

    let (mut candidate, source, clear_hint_next_run) = if let Some(at) = one_shot {
        (at, RunSource::AiOneshot, true)
    } else if let (true, Some(interval_ms)) = (fresh, endpoint.ai_hint_interval_ms) {
        (
            now + Duration::milliseconds(interval_ms),
            RunSource::AiInterval,
            false,
        )
    } else {
        let (at, source) = baseline_next(endpoint, now)?;
        (at, source, false)
    };

    // A hint may ask for "immediately" but never for the past.
    if candidate <= now {
        candidate = now + Duration::seconds(1);
    }

    let (candidate, source) = clamp(endpoint, candidate, source, now);

    Ok(Decision {
        next_run_at: candidate,
        failure_count: 0,
        source,
        clear_hint_next_run,
        clear_expired_hints,
    })
}

/// Baseline rule alone: what the user-configured cadence says, ignoring hints,
/// pauses, and failures. Used for the initial `next_run_at` of a new endpoint.
pub fn baseline_next(
    endpoint: &JobEndpoint,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, RunSource), CronError> {
    match endpoint.baseline() {
        Baseline::Cron(expr) => Ok((cron::next_after(expr, now)?, RunSource::BaselineCron)),
        Baseline::IntervalMs(ms) => Ok((
            now + Duration::milliseconds(ms),
            RunSource::BaselineInterval,
        )),
    }
}

/// Apply the user-owned min/max guardrails. Hint-driven candidates that get
/// moved are re-labeled so the run records which clamp fired.
fn clamp(
    endpoint: &JobEndpoint,
    candidate: DateTime<Utc>,
    source: RunSource,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, RunSource) {
    let from_hint = matches!(source, RunSource::AiInterval | RunSource::AiOneshot);
    let delta_ms = (candidate - now).num_milliseconds();

    if let Some(min) = endpoint.min_interval_ms {
        if delta_ms < min {
            let source = if from_hint { RunSource::ClampedMin } else { source };
            return (now + Duration::milliseconds(min), source);
        }
    }
    if let Some(max) = endpoint.max_interval_ms {
        if delta_ms > max {
            let source = if from_hint { RunSource::ClampedMax } else { source };
            return (now + Duration::milliseconds(max), source);
        }
    }
    (candidate, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::types::Json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap()
    }

    fn interval_endpoint(interval_ms: i64) -> JobEndpoint {
        JobEndpoint::builder()
            .job_id(Uuid::new_v4())
            .tenant_id(Uuid::new_v4())
            .name("probe")
            .url("https://example.com/health")
            .baseline_interval_ms(interval_ms)
            .headers_json(Json(BTreeMap::new()))
            .next_run_at(t0())
            .build()
    }

    #[test]
    fn success_follows_baseline_interval() {
        let endpoint = interval_endpoint(60_000);
        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(60));
        assert_eq!(decision.source, RunSource::BaselineInterval);
        assert_eq!(decision.failure_count, 0);
    }

    #[test]
    fn success_follows_cron_baseline() {
        let mut endpoint = interval_endpoint(0);
        endpoint.baseline_interval_ms = None;
        endpoint.baseline_cron = Some("0 9 * * 0".to_string());

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(
            decision.next_run_at,
            Utc.with_ymd_and_hms(2025, 10, 5, 9, 0, 0).unwrap()
        );
        assert_eq!(decision.source, RunSource::BaselineCron);
    }

    #[test]
    fn failure_backoff_doubles_and_resets_on_success() {
        let mut endpoint = interval_endpoint(60_000);

        let first = plan_next(&endpoint, false, t0()).unwrap();
        assert_eq!(first.failure_count, 1);
        assert_eq!(first.next_run_at, t0() + Duration::milliseconds(120_000));

        endpoint.failure_count = first.failure_count;
        let second = plan_next(&endpoint, false, t0()).unwrap();
        assert_eq!(second.failure_count, 2);
        assert_eq!(second.next_run_at, t0() + Duration::milliseconds(240_000));

        endpoint.failure_count = second.failure_count;
        let recovered = plan_next(&endpoint, true, t0()).unwrap();
        assert_eq!(recovered.failure_count, 0);
        assert_eq!(recovered.next_run_at, t0() + Duration::seconds(60));
    }

    #[test]
    fn backoff_is_bounded_by_the_ceiling() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.failure_count = 63;

        let decision = plan_next(&endpoint, false, t0()).unwrap();

        assert_eq!(decision.failure_count, 64);
        assert_eq!(
            decision.next_run_at,
            t0() + Duration::milliseconds(BACKOFF_CEILING_MS)
        );
    }

    #[test]
    fn backoff_ceiling_widens_with_max_interval() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.max_interval_ms = Some(7_200_000);
        endpoint.failure_count = 63;

        let decision = plan_next(&endpoint, false, t0()).unwrap();

        assert_eq!(
            decision.next_run_at,
            t0() + Duration::milliseconds(7_200_000)
        );
    }

    #[test]
    fn failure_count_caps_at_sixty_four() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.failure_count = MAX_FAILURE_COUNT;

        let decision = plan_next(&endpoint, false, t0()).unwrap();

        assert_eq!(decision.failure_count, MAX_FAILURE_COUNT);
    }

    #[test]
    fn failure_ignores_fresh_hints() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.ai_hint_interval_ms = Some(5_000);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, false, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::milliseconds(120_000));
        assert_eq!(decision.source, RunSource::BaselineInterval);
    }

    #[test]
    fn fresh_interval_hint_overrides_baseline() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.ai_hint_interval_ms = Some(30_000);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(30));
        assert_eq!(decision.source, RunSource::AiInterval);
    }

    #[test]
    fn tight_hint_is_clamped_to_min() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.min_interval_ms = Some(60_000);
        endpoint.ai_hint_interval_ms = Some(10_000);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(60));
        assert_eq!(decision.source, RunSource::ClampedMin);
    }

    #[test]
    fn wide_hint_is_clamped_to_max() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.max_interval_ms = Some(600_000);
        endpoint.ai_hint_interval_ms = Some(3_600_000);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(600));
        assert_eq!(decision.source, RunSource::ClampedMax);
    }

    #[test]
    fn clamped_baseline_keeps_its_source() {
        let mut endpoint = interval_endpoint(30_000);
        endpoint.min_interval_ms = Some(60_000);

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(60));
        assert_eq!(decision.source, RunSource::BaselineInterval);
    }

    #[test]
    fn one_shot_hint_fires_once_and_is_consumed() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.ai_hint_next_run_at = Some(t0() + Duration::seconds(45));
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(45));
        assert_eq!(decision.source, RunSource::AiOneshot);
        assert!(decision.clear_hint_next_run);
    }

    #[test]
    fn past_one_shot_falls_back_to_baseline() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.ai_hint_next_run_at = Some(t0() - Duration::seconds(1));
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(300));
        assert_eq!(decision.source, RunSource::BaselineInterval);
        assert!(!decision.clear_hint_next_run);
    }

    #[test]
    fn stale_hint_is_ignored_and_flagged() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.ai_hint_interval_ms = Some(10_000);
        endpoint.ai_hint_expires_at = Some(t0() - Duration::seconds(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(300));
        assert_eq!(decision.source, RunSource::BaselineInterval);
        assert!(decision.clear_expired_hints);
    }

    #[test]
    fn zero_interval_hint_becomes_one_second() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.ai_hint_interval_ms = Some(0);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(1));
        assert_eq!(decision.source, RunSource::AiInterval);
    }

    #[test]
    fn active_pause_owns_the_next_fire_time() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.paused_until = Some(t0() + Duration::hours(1));
        endpoint.failure_count = 3;

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::hours(1));
        assert_eq!(decision.failure_count, 3);
        assert_eq!(decision.source, RunSource::BaselineInterval);
    }

    #[test]
    fn expired_pause_is_ignored() {
        let mut endpoint = interval_endpoint(60_000);
        endpoint.paused_until = Some(t0() - Duration::seconds(1));

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(decision.next_run_at, t0() + Duration::seconds(60));
    }

    #[test]
    fn decision_is_idempotent_for_same_inputs() {
        let mut endpoint = interval_endpoint(300_000);
        endpoint.min_interval_ms = Some(60_000);
        endpoint.ai_hint_interval_ms = Some(10_000);
        endpoint.ai_hint_expires_at = Some(t0() + Duration::hours(1));

        let first = plan_next(&endpoint, true, t0()).unwrap();
        let second = plan_next(&endpoint, true, t0()).unwrap();

        assert_eq!(first, second);
    }
}

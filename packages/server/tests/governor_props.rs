//! Property tests for the governor's quantified invariants.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use sqlx::types::Json;
use std::collections::BTreeMap;
use uuid::Uuid;

use cadence_core::domains::jobs::models::{JobEndpoint, MAX_FAILURE_COUNT};
use cadence_core::kernel::governor::{plan_next, BACKOFF_CEILING_MS};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
struct EndpointSpec {
    interval_ms: i64,
    failure_count: i32,
    clamps: Option<(i64, i64)>,
    hint: Option<HintSpec>,
    paused_offset_s: Option<i64>,
}

#[derive(Debug, Clone)]
struct HintSpec {
    interval_ms: Option<i64>,
    one_shot_offset_ms: Option<i64>,
    expires_offset_s: i64,
}

fn arb_hint() -> impl Strategy<Value = HintSpec> {
    (
        prop::option::of(0i64..1_000_000),
        prop::option::of(-60_000i64..1_000_000),
        -3_600i64..3_600,
    )
        .prop_map(|(interval_ms, one_shot_offset_ms, expires_offset_s)| HintSpec {
            interval_ms,
            one_shot_offset_ms,
            expires_offset_s,
        })
}

fn arb_endpoint() -> impl Strategy<Value = EndpointSpec> {
    (
        1i64..10_000_000,
        0i32..=70,
        prop::option::of((1i64..7_200_000, 1i64..7_200_000)),
        prop::option::of(arb_hint()),
        prop::option::of(-600i64..7_200),
    )
        .prop_map(
            |(interval_ms, failure_count, clamps, hint, paused_offset_s)| EndpointSpec {
                interval_ms,
                failure_count,
                clamps: clamps.map(|(a, b)| (a.min(b), a.max(b))),
                hint,
                paused_offset_s,
            },
        )
}

fn build(spec: &EndpointSpec) -> JobEndpoint {
    let now = t0();
    let mut endpoint = JobEndpoint::builder()
        .job_id(Uuid::new_v4())
        .tenant_id(Uuid::new_v4())
        .name("probe")
        .url("https://example.com/hook")
        .baseline_interval_ms(spec.interval_ms)
        .headers_json(Json(BTreeMap::new()))
        .next_run_at(now)
        .build();
    endpoint.failure_count = spec.failure_count.min(MAX_FAILURE_COUNT);
    if let Some((min, max)) = spec.clamps {
        endpoint.min_interval_ms = Some(min);
        endpoint.max_interval_ms = Some(max);
    }
    if let Some(hint) = &spec.hint {
        endpoint.ai_hint_interval_ms = hint.interval_ms;
        endpoint.ai_hint_next_run_at = hint
            .one_shot_offset_ms
            .map(|off| now + Duration::milliseconds(off));
        endpoint.ai_hint_expires_at = Some(now + Duration::seconds(hint.expires_offset_s));
    }
    endpoint.paused_until = spec
        .paused_offset_s
        .map(|off| now + Duration::seconds(off));
    endpoint
}

proptest! {
    /// Backoff never exceeds max(max_interval, 1 hour) and the failure streak
    /// counter stays capped.
    #[test]
    fn backoff_is_bounded(spec in arb_endpoint()) {
        let mut endpoint = build(&spec);
        endpoint.paused_until = None;

        let decision = plan_next(&endpoint, false, t0()).unwrap();

        prop_assert!(decision.failure_count <= MAX_FAILURE_COUNT);
        let ceiling = endpoint.max_interval_ms.unwrap_or(0).max(BACKOFF_CEILING_MS);
        let delta = (decision.next_run_at - t0()).num_milliseconds();
        prop_assert!(delta <= ceiling);
        prop_assert!(delta > 0);
    }

    /// After a success the endpoint always moves forward in time.
    #[test]
    fn success_always_schedules_into_the_future(spec in arb_endpoint()) {
        let endpoint = build(&spec);

        let decision = plan_next(&endpoint, true, t0()).unwrap();

        prop_assert!(decision.next_run_at > t0());
    }

    /// Re-running the governor on identical inputs yields the identical
    /// decision: clamping twice clamps to the same place.
    #[test]
    fn decisions_are_idempotent(spec in arb_endpoint(), success in any::<bool>()) {
        let endpoint = build(&spec);

        let first = plan_next(&endpoint, success, t0()).unwrap();
        let second = plan_next(&endpoint, success, t0()).unwrap();

        prop_assert_eq!(first, second);
    }

    /// An expired hint never influences the decision: the output equals that
    /// of the same endpoint with no hint stored at all.
    #[test]
    fn stale_hints_never_influence_decisions(spec in arb_endpoint(), success in any::<bool>()) {
        let mut endpoint = build(&spec);
        // Force the hint (if any) to be expired.
        if endpoint.ai_hint_expires_at.is_some() {
            endpoint.ai_hint_expires_at = Some(t0() - Duration::seconds(1));
        }

        let mut hintless = endpoint.clone();
        hintless.ai_hint_interval_ms = None;
        hintless.ai_hint_next_run_at = None;
        hintless.ai_hint_expires_at = None;

        let with_stale = plan_next(&endpoint, success, t0()).unwrap();
        let without = plan_next(&hintless, success, t0()).unwrap();

        prop_assert_eq!(with_stale.next_run_at, without.next_run_at);
        prop_assert_eq!(with_stale.source, without.source);
        prop_assert_eq!(with_stale.failure_count, without.failure_count);
    }

    /// Successful decisions always land inside the user's guardrails.
    #[test]
    fn clamps_are_always_respected_on_success(spec in arb_endpoint()) {
        let mut endpoint = build(&spec);
        endpoint.paused_until = None;

        let decision = plan_next(&endpoint, true, t0()).unwrap();
        let delta = (decision.next_run_at - t0()).num_milliseconds();

        if let Some(min) = endpoint.min_interval_ms {
            prop_assert!(delta >= min);
        }
        if let Some(max) = endpoint.max_interval_ms {
            prop_assert!(delta <= max);
        }
    }
}

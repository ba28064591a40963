//! Test fixtures for creating test data.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use cadence_core::common::auth::Actor;
use cadence_core::domains::jobs::manager::{NewEndpoint, NewJob};
use cadence_core::domains::jobs::models::{Job, JobEndpoint};

use super::harness::World;

pub fn actor() -> Actor {
    Actor::new(Uuid::new_v4())
}

pub fn new_job(name: &str) -> NewJob {
    NewJob::builder().name(name).build()
}

/// Endpoint input with a fixed-interval baseline.
pub fn interval_endpoint(name: &str, interval_ms: i64) -> NewEndpoint {
    NewEndpoint::builder()
        .name(name)
        .url("https://example.com/hook")
        .baseline_interval_ms(interval_ms)
        .build()
}

/// Endpoint input with a cron baseline.
pub fn cron_endpoint(name: &str, expr: &str) -> NewEndpoint {
    NewEndpoint::builder()
        .name(name)
        .url("https://example.com/hook")
        .baseline_cron(expr)
        .build()
}

/// Create a job with one interval endpoint and return both.
pub async fn seed_interval_endpoint(
    world: &World,
    actor: Actor,
    interval_ms: i64,
) -> (Job, JobEndpoint) {
    let job = world
        .manager
        .create_job(actor, new_job("checks"))
        .await
        .expect("create job");
    let endpoint = world
        .manager
        .add_endpoint(actor, job.id, interval_endpoint("probe", interval_ms))
        .await
        .expect("add endpoint");
    (job, endpoint)
}

/// Current snapshot of an endpoint, panicking if it disappeared.
pub fn endpoint_state(world: &World, id: Uuid) -> JobEndpoint {
    world.jobs.endpoint(id).expect("endpoint exists")
}

/// Shorthand for an absolute offset from a start instant.
pub fn at_ms(start: DateTime<Utc>, offset_ms: i64) -> DateTime<Utc> {
    start + chrono::Duration::milliseconds(offset_ms)
}

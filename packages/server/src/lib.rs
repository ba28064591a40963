// Adaptive HTTP job scheduler - core engine
//
// Users register endpoints that fire on a cron expression or fixed interval;
// the engine dispatches them, records outcomes, and continuously adjusts the
// next fire time from baselines, planner hints, and failure backoff, all
// bounded by user-owned guardrails.
//
// The HTTP API, authentication strategies, and the AI planner itself live
// outside this crate; the core exposes managers, repos, and the planner
// gateway as its surface.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;

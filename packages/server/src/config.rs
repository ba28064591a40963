use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::domains::jobs::manager::TierLimits;
use crate::kernel::maintenance::DEFAULT_ZOMBIE_THRESHOLD_MS;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool_size: u32,
    pub worker_id: Option<String>,
    pub batch_size: i64,
    pub max_concurrency: usize,
    pub lease_margin_ms: i64,
    pub drain_timeout: Duration,
    pub zombie_threshold_ms: i64,
    pub tier_limits: TierLimits,
    /// Process-wide key for sealing sensitive header values. Optional; without
    /// it headers are stored as provided.
    pub header_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            pool_size: parse_or("DATABASE_POOL_SIZE", 10)?,
            worker_id: env::var("SCHEDULER_WORKER_ID").ok(),
            batch_size: parse_or("SCHEDULER_BATCH_SIZE", 25)?,
            max_concurrency: parse_or("SCHEDULER_MAX_CONCURRENCY", 32)?,
            lease_margin_ms: parse_or("SCHEDULER_LEASE_MARGIN_MS", 10_000)?,
            drain_timeout: Duration::from_millis(parse_or("SCHEDULER_DRAIN_TIMEOUT_MS", 30_000)?),
            zombie_threshold_ms: parse_or("ZOMBIE_RUN_THRESHOLD_MS", DEFAULT_ZOMBIE_THRESHOLD_MS)?,
            tier_limits: TierLimits {
                free: parse_or("TIER_FREE_ENDPOINT_LIMIT", 10)?,
                pro: parse_or("TIER_PRO_ENDPOINT_LIMIT", 100)?,
            },
            header_key: env::var("HEADER_ENCRYPTION_KEY").ok(),
        })
    }
}

fn parse_or<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{var} must be a valid number")),
        Err(_) => Ok(default),
    }
}

//! Run model: one dispatch attempt and its outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Provisional status at creation; finalized by the dispatch outcome.
    #[default]
    Failed,
    Timeout,
}

/// Which rule chose the fire time this run reflects.
///
/// Persisted as text; the vocabulary is part of the storage contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunSource {
    BaselineInterval,
    BaselineCron,
    AiInterval,
    AiOneshot,
    ClampedMin,
    ClampedMax,
    Manual,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::BaselineInterval => "baseline-interval",
            RunSource::BaselineCron => "baseline-cron",
            RunSource::AiInterval => "ai-interval",
            RunSource::AiOneshot => "ai-oneshot",
            RunSource::ClampedMin => "clamped-min",
            RunSource::ClampedMax => "clamped-max",
            RunSource::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RunSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline-interval" => Ok(RunSource::BaselineInterval),
            "baseline-cron" => Ok(RunSource::BaselineCron),
            "ai-interval" => Ok(RunSource::AiInterval),
            "ai-oneshot" => Ok(RunSource::AiOneshot),
            "clamped-min" => Ok(RunSource::ClampedMin),
            "clamped-max" => Ok(RunSource::ClampedMax),
            "manual" => Ok(RunSource::Manual),
            other => Err(format!("unknown run source: {other}")),
        }
    }
}

impl TryFrom<String> for RunSource {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One dispatch attempt. Created with a provisional `failed` status right
/// before dispatch and finalized exactly once; never mutated afterwards.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub status: RunStatus,
    pub attempt: i32,
    #[sqlx(try_from = "String")]
    pub source: RunSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub response_body: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_text() {
        for source in [
            RunSource::BaselineInterval,
            RunSource::BaselineCron,
            RunSource::AiInterval,
            RunSource::AiOneshot,
            RunSource::ClampedMin,
            RunSource::ClampedMax,
            RunSource::Manual,
        ] {
            assert_eq!(source.as_str().parse::<RunSource>().unwrap(), source);
        }
    }

    #[test]
    fn unknown_source_is_rejected() {
        assert!("retry-storm".parse::<RunSource>().is_err());
    }
}

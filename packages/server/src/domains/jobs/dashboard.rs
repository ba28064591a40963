//! Per-user dashboard aggregation.
//!
//! Shapes repo aggregates into chart-ready series: a fixed bucket grid over
//! the requested window, zero-filled so stacking math downstream stays stable.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::common::auth::Actor;
use crate::common::clock::Clock;
use super::jobs_repo::JobsRepo;
use super::models::EndpointCounts;
use super::runs_repo::{Granularity, MetricsFilter, RunMetrics, RunsRepo};
use super::sessions_repo::SessionsRepo;

/// Per-endpoint series are limited to this many endpoints, ranked by run
/// count inside the window.
pub const TOP_ENDPOINT_LIMIT: usize = 20;

/// Success-rate movements inside this deadband read as stable.
const TREND_DEADBAND: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// Bucket step used for a window span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStep {
    Hourly,
    SixHourly,
    Daily,
}

impl BucketStep {
    /// Span ≤ 1 day: hourly. Span ≤ 14 days: every 6th hour. Else: daily.
    pub fn for_span(span: Duration) -> Self {
        if span <= Duration::days(1) {
            BucketStep::Hourly
        } else if span <= Duration::days(14) {
            BucketStep::SixHourly
        } else {
            BucketStep::Daily
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            BucketStep::Hourly | BucketStep::SixHourly => Granularity::Hour,
            BucketStep::Daily => Granularity::Day,
        }
    }

    pub fn width(&self) -> Duration {
        match self {
            BucketStep::Hourly => Duration::hours(1),
            BucketStep::SixHourly => Duration::hours(6),
            BucketStep::Daily => Duration::days(1),
        }
    }

    /// Snap an instant down onto the bucket grid.
    pub fn floor(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BucketStep::Hourly => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
                .unwrap(),
            BucketStep::SixHourly => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour() - t.hour() % 6, 0, 0)
                .unwrap(),
            BucketStep::Daily => Utc
                .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                .unwrap(),
        }
    }

    /// ISO label: `YYYY-MM-DD` for daily buckets, `YYYY-MM-DD HH:00:00`
    /// otherwise.
    pub fn label(&self, bucket: DateTime<Utc>) -> String {
        match self {
            BucketStep::Daily => bucket.format("%Y-%m-%d").to_string(),
            _ => bucket.format("%Y-%m-%d %H:00:00").to_string(),
        }
    }

    /// The full zero-fill grid covering `[start, end]`.
    pub fn grid(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut buckets = Vec::new();
        let mut cursor = self.floor(start);
        while cursor <= end {
            buckets.push(cursor);
            cursor += self.width();
        }
        buckets
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub date: String,
    pub success: i64,
    pub failure: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionPoint {
    pub date: String,
    pub sessions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSeries {
    pub endpoint_id: Uuid,
    pub endpoint_name: String,
    pub total_duration_ms: i64,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub job_count: i64,
    pub endpoint_counts: EndpointCounts,
    pub last_24h: RunMetrics,
    pub success_rate_trend: Trend,
    pub runs_series: Vec<SeriesPoint>,
    pub endpoint_series: Vec<EndpointSeries>,
    pub session_series: Vec<SessionPoint>,
}

pub struct DashboardManager {
    jobs: Arc<dyn JobsRepo>,
    runs: Arc<dyn RunsRepo>,
    sessions: Arc<dyn SessionsRepo>,
    clock: Arc<dyn Clock>,
}

impl DashboardManager {
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

    pub async fn overview(
        &self,
        actor: Actor,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DashboardStats> {
        let now = self.clock.now();
        let span = end - start;
        let step = BucketStep::for_span(span);
        let granularity = step.granularity();

        let job_count = self.jobs.list_jobs(actor.user_id).await?.len() as i64;
        let endpoint_counts = self.jobs.endpoint_counts(actor.user_id, now).await?;

        let last_24h = self
            .runs
            .get_filtered_metrics(&MetricsFilter {
                user_id: actor.user_id,
                job_id: None,
                source: None,
                since: now - Duration::hours(24),
                until: now,
            })
            .await?;

        let success_rate_trend = self.trend(actor.user_id, start, end).await?;

        let grid = step.grid(start, end);

        // Overall run series, zero-filled over the grid.
        let raw_runs = self
            .runs
            .get_run_time_series(actor.user_id, start, end, granularity)
            .await?;
        let mut run_cells: HashMap<DateTime<Utc>, (i64, i64)> = HashMap::new();
        for bucket in raw_runs {
            let cell = run_cells.entry(step.floor(bucket.bucket)).or_default();
            cell.0 += bucket.success;
            cell.1 += bucket.failure;
        }
        let runs_series = grid
            .iter()
            .map(|bucket| {
                let (success, failure) = run_cells.get(bucket).copied().unwrap_or_default();
                SeriesPoint {
                    date: step.label(*bucket),
                    success,
                    failure,
                }
            })
            .collect();

        // Per-endpoint series: rank by run volume, keep the top K, zero-fill
        // every kept endpoint across the whole grid.
        let raw_endpoints = self
            .runs
            .get_endpoint_time_series(actor.user_id, start, end, granularity)
            .await?;
        let mut totals: HashMap<Uuid, (String, i64, i64)> = HashMap::new();
        let mut endpoint_cells: HashMap<(Uuid, DateTime<Utc>), (i64, i64)> = HashMap::new();
        for cell in raw_endpoints {
            let entry = totals
                .entry(cell.endpoint_id)
                .or_insert((cell.endpoint_name.clone(), 0, 0));
            entry.1 += cell.success + cell.failure;
            entry.2 += cell.total_duration_ms;
            let grid_cell = endpoint_cells
                .entry((cell.endpoint_id, step.floor(cell.bucket)))
                .or_default();
            grid_cell.0 += cell.success;
            grid_cell.1 += cell.failure;
        }
        let mut ranked: Vec<(Uuid, String, i64, i64)> = totals
            .into_iter()
            .map(|(id, (name, count, duration))| (id, name, count, duration))
            .collect();
        ranked.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        ranked.truncate(TOP_ENDPOINT_LIMIT);

        let endpoint_series = ranked
            .into_iter()
            .map(|(endpoint_id, endpoint_name, _, total_duration_ms)| EndpointSeries {
                endpoint_id,
                endpoint_name,
                total_duration_ms,
                points: grid
                    .iter()
                    .map(|bucket| {
                        let (success, failure) = endpoint_cells
                            .get(&(endpoint_id, *bucket))
                            .copied()
                            .unwrap_or_default();
                        SeriesPoint {
                            date: step.label(*bucket),
                            success,
                            failure,
                        }
                    })
                    .collect(),
            })
            .collect();

        // Planner activity, zero-filled on the same grid.
        let raw_sessions = self
            .sessions
            .session_time_series(actor.user_id, start, end, granularity)
            .await?;
        let mut session_cells: HashMap<DateTime<Utc>, i64> = HashMap::new();
        for bucket in raw_sessions {
            *session_cells.entry(step.floor(bucket.bucket)).or_default() += bucket.sessions;
        }
        let session_series = grid
            .iter()
            .map(|bucket| SessionPoint {
                date: step.label(*bucket),
                sessions: session_cells.get(bucket).copied().unwrap_or(0),
            })
            .collect();

        Ok(DashboardStats {
            job_count,
            endpoint_counts,
            last_24h,
            success_rate_trend,
            runs_series,
            endpoint_series,
            session_series,
        })
    }

    /// Success rate of the window against the prior equal-length window.
    async fn trend(
        &self,
        user_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Trend> {
        let span = end - start;
        let current = self
            .runs
            .get_filtered_metrics(&MetricsFilter {
                user_id,
                job_id: None,
                source: None,
                since: start,
                until: end,
            })
            .await?;
        let previous = self
            .runs
            .get_filtered_metrics(&MetricsFilter {
                user_id,
                job_id: None,
                source: None,
                since: start - span,
                until: start,
            })
            .await?;

        Ok(compare_rates(
            success_rate(&current),
            success_rate(&previous),
        ))
    }
}

fn success_rate(metrics: &RunMetrics) -> Option<f64> {
    (metrics.total > 0).then(|| metrics.success as f64 / metrics.total as f64)
}

fn compare_rates(current: Option<f64>, previous: Option<f64>) -> Trend {
    match (current, previous) {
        (Some(current), Some(previous)) => {
            let delta = current - previous;
            if delta > TREND_DEADBAND {
                Trend::Up
            } else if delta < -TREND_DEADBAND {
                Trend::Down
            } else {
                Trend::Stable
            }
        }
        _ => Trend::Stable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn step_selection_follows_span() {
        assert_eq!(BucketStep::for_span(Duration::hours(6)), BucketStep::Hourly);
        assert_eq!(BucketStep::for_span(Duration::days(1)), BucketStep::Hourly);
        assert_eq!(
            BucketStep::for_span(Duration::days(7)),
            BucketStep::SixHourly
        );
        assert_eq!(BucketStep::for_span(Duration::days(30)), BucketStep::Daily);
    }

    #[test]
    fn six_hourly_floor_snaps_to_grid() {
        let step = BucketStep::SixHourly;
        assert_eq!(step.floor(at(2025, 3, 10, 0)), at(2025, 3, 10, 0));
        assert_eq!(step.floor(at(2025, 3, 10, 5)), at(2025, 3, 10, 0));
        assert_eq!(step.floor(at(2025, 3, 10, 13)), at(2025, 3, 10, 12));
        assert_eq!(step.floor(at(2025, 3, 10, 23)), at(2025, 3, 10, 18));
    }

    #[test]
    fn seven_day_grid_has_about_28_points() {
        let step = BucketStep::SixHourly;
        let grid = step.grid(at(2025, 3, 1, 0), at(2025, 3, 8, 0));
        assert_eq!(grid.len(), 29);
    }

    #[test]
    fn labels_match_granularity() {
        assert_eq!(
            BucketStep::Daily.label(at(2025, 3, 10, 0)),
            "2025-03-10"
        );
        assert_eq!(
            BucketStep::Hourly.label(at(2025, 3, 10, 13)),
            "2025-03-10 13:00:00"
        );
    }

    #[test]
    fn trend_respects_deadband() {
        assert_eq!(compare_rates(Some(0.95), Some(0.94)), Trend::Stable);
        assert_eq!(compare_rates(Some(0.99), Some(0.90)), Trend::Up);
        assert_eq!(compare_rates(Some(0.80), Some(0.95)), Trend::Down);
        assert_eq!(compare_rates(None, Some(0.95)), Trend::Stable);
        assert_eq!(compare_rates(Some(0.95), None), Trend::Stable);
    }
}

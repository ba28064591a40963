//! Clock abstraction for time-sensitive scheduling decisions.
//!
//! Every component that reads "now" or sleeps does so through [`Clock`] so the
//! scheduler, governor, and lease protocol stay deterministic under test.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Source of "now" with millisecond resolution, plus task suspension.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current UTC instant. Non-decreasing across calls.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for at least `d`.
    async fn sleep(&self, d: Duration);
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Test clock whose time only moves when told to.
///
/// `sleep` advances the clock by the requested duration and returns
/// immediately, so loops driven by [`Clock::sleep`] make progress without
/// wall-clock waits.
#[derive(Debug)]
pub struct ManualClock {
    epoch_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            epoch_ms: AtomicI64::new(start.timestamp_millis()),
        })
    }

    /// Move time forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.epoch_ms
            .fetch_add(d.as_millis() as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute instant. Never moves backwards.
    pub fn set(&self, t: DateTime<Utc>) {
        self.epoch_ms
            .fetch_max(t.timestamp_millis(), Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    async fn sleep(&self, d: Duration) {
        self.advance(d);
        // Yield so concurrent tasks interleave the way real sleeps allow.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let start = Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.sleep(Duration::from_secs(60)).await;

        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }

    #[test]
    fn manual_clock_set_never_rewinds() {
        let start = Utc.with_ymd_and_hms(2025, 10, 4, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        clock.set(start - chrono::Duration::hours(1));

        assert_eq!(clock.now(), start);
    }
}

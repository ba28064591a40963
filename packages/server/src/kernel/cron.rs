//! 5-field cron expressions, UTC only.
//!
//! The accepted dialect is minute / hour / day-of-month / month / day-of-week
//! with `*`, lists (`a,b,c`), ranges (`a-b`), and steps (`*/n`). No seconds
//! field, no timezone, no named values. Occurrence math is delegated to the
//! `cron` crate with a fixed zero seconds column.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use thiserror::Error;

/// Next occurrences further out than this are treated as misconfiguration.
pub const HORIZON_DAYS: i64 = 366;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    Invalid { expr: String, reason: String },
    #[error("cron expression {expr:?} has no occurrence within {HORIZON_DAYS} days")]
    HorizonExceeded { expr: String },
}

/// A validated 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    source: String,
    schedule: Schedule,
}

impl CronExpr {
    /// Parse and validate the 5-field dialect.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::Invalid {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }
        for field in &fields {
            if !field
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | ',' | '-' | '/'))
            {
                return Err(CronError::Invalid {
                    expr: expr.to_string(),
                    reason: format!("field {field:?} contains unsupported syntax"),
                });
            }
        }

        // The cron crate wants a seconds column; pin it to zero.
        let with_seconds = format!("0 {trimmed}");
        let schedule = Schedule::from_str(&with_seconds).map_err(|e| CronError::Invalid {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Next occurrence strictly after `after`, bounded by the safety horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let mut upcoming = self.schedule.after(&after);
        let next = loop {
            match upcoming.next() {
                Some(t) if t <= after => continue,
                Some(t) => break t,
                None => {
                    return Err(CronError::HorizonExceeded {
                        expr: self.source.clone(),
                    })
                }
            }
        };

        if next - after > Duration::days(HORIZON_DAYS) {
            return Err(CronError::HorizonExceeded {
                expr: self.source.clone(),
            });
        }
        Ok(next)
    }
}

/// Parse-and-compute convenience for callers holding a raw expression.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronExpr::parse(expr)?.next_after(after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("0 0 * * * *").is_err());
    }

    #[test]
    fn rejects_named_values() {
        assert!(CronExpr::parse("0 0 * * MON").is_err());
        assert!(CronExpr::parse("@hourly").is_err());
    }

    #[test]
    fn accepts_steps_lists_and_ranges() {
        assert!(CronExpr::parse("*/5 * * * *").is_ok());
        assert!(CronExpr::parse("0 9,17 * * 1-5").is_ok());
        assert!(CronExpr::parse("30 3 1 * *").is_ok());
    }

    #[test]
    fn sunday_morning_schedule() {
        // Saturday 2025-10-04; next Sunday-09:00 occurrence is the 5th.
        let after = Utc.with_ymd_and_hms(2025, 10, 4, 0, 0, 0).unwrap();
        let next = next_after("0 9 * * 0", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 10, 5, 9, 0, 0).unwrap());
    }

    #[test]
    fn exact_boundary_advances_to_following_occurrence() {
        let on_the_hour = Utc.with_ymd_and_hms(2025, 10, 4, 9, 0, 0).unwrap();
        let next = next_after("0 9 * * *", on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 10, 5, 9, 0, 0).unwrap());
    }

    #[test]
    fn far_out_occurrence_exceeds_horizon() {
        // February 30th never exists; the schedule has no occurrence at all.
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let result = next_after("0 0 30 2 *", after);
        assert!(matches!(result, Err(CronError::HorizonExceeded { .. })));
    }

    #[test]
    fn every_minute_advances_by_one_minute() {
        let after = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 15).unwrap();
        let next = next_after("* * * * *", after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 1, 12, 31, 0).unwrap());
    }
}

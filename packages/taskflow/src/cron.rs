//! Cron evaluation for recurring definitions.
//!
//! Wraps the `cron` crate to answer the two questions the scheduler asks:
//! the next fire time strictly after an instant, and the most recent fire
//! time strictly before one. Input expressions are standard 5-field cron
//! (minute, hour, day-of-month, month, day-of-week) with ranges, lists,
//! and step values; a seconds field is prepended during normalization.

use std::str::FromStr;

use ::cron::Schedule;
use chrono::{DateTime, Duration, Utc};

use crate::core::error::{Result, TaskflowError};

/// Look-back horizons, in days, tried in order by [`CronSchedule::prev_before`].
const PREV_LOOKBACK_DAYS: [i64; 4] = [1, 7, 35, 370];

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    expression: String,
}

impl CronSchedule {
    /// Parse a standard 5-field cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = format!("0 {}", expression.trim());
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| TaskflowError::InvalidSchedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            schedule,
            expression: expression.to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The next fire time strictly after `base`.
    pub fn next_after(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&base).find(|tick| *tick > base)
    }

    /// The most recent fire time strictly before `base`, or `None` when no
    /// tick fell within the widest look-back horizon.
    pub fn prev_before(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for days in PREV_LOOKBACK_DAYS {
            let start = base - Duration::days(days);
            let last = self
                .schedule
                .after(&start)
                .take_while(|tick| *tick < base)
                .last();
            if last.is_some() {
                return last;
            }
        }
        None
    }
}

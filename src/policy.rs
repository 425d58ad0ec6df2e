//! Schedule policy: draws the next login instant for a site.
//!
//! A policy is a window of whole minutes ahead of "now" (`date_minutes_*`)
//! and, optionally, a window of minutes after midnight in which the login is
//! allowed to happen (`allowed_time_minutes_*`). When the date bounds are
//! whole days the drawn instant is pinned to a random time of day inside the
//! allowed window; otherwise the raw minute offset is used as-is.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minutes in one day.
pub const MINUTES_PER_DAY: u32 = 1440;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("date_minutes_end ({end}) must be greater than or equal to date_minutes_start ({start})")]
    DateRangeInverted { start: u32, end: u32 },

    #[error("allowed_time_minutes_end ({end}) must be greater than or equal to allowed_time_minutes_start ({start})")]
    TimeRangeInverted { start: u32, end: u32 },

    #[error("allowed time window must end within one day (<= 1440 minutes), got {end}")]
    TimeOutOfDay { end: u32 },

    #[error("{field} must be a multiple of 1440 minutes when the allowed time window is restricted, got {value}")]
    NotDayAligned { field: &'static str, value: u32 },
}

/// Raw, unvalidated policy fields as they arrive from storage or user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFields {
    pub date_minutes_start: u32,
    #[serde(default)]
    pub date_minutes_end: Option<u32>,
    #[serde(default)]
    pub allowed_time_minutes_start: Option<u32>,
    #[serde(default)]
    pub allowed_time_minutes_end: Option<u32>,
}

/// A validated schedule policy.
///
/// Construct with [`SchedulePolicy::new`]; the invariants are checked once
/// and every accessor returns the defaulted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyFields", into = "PolicyFields")]
pub struct SchedulePolicy {
    fields: PolicyFields,
}

impl SchedulePolicy {
    pub fn new(
        date_minutes_start: u32,
        date_minutes_end: Option<u32>,
        allowed_time_minutes_start: Option<u32>,
        allowed_time_minutes_end: Option<u32>,
    ) -> Result<Self, PolicyError> {
        Self::try_from(PolicyFields {
            date_minutes_start,
            date_minutes_end,
            allowed_time_minutes_start,
            allowed_time_minutes_end,
        })
    }

    /// A policy that fires every `days` days at any time of day.
    pub fn every_days(days: u32) -> Self {
        Self {
            fields: PolicyFields {
                date_minutes_start: days * MINUTES_PER_DAY,
                date_minutes_end: None,
                allowed_time_minutes_start: None,
                allowed_time_minutes_end: None,
            },
        }
    }

    pub fn fields(&self) -> PolicyFields {
        self.fields
    }

    pub fn date_minutes_start(&self) -> u32 {
        self.fields.date_minutes_start
    }

    pub fn date_minutes_end(&self) -> u32 {
        self.fields
            .date_minutes_end
            .unwrap_or(self.fields.date_minutes_start)
    }

    pub fn allowed_start(&self) -> u32 {
        self.fields.allowed_time_minutes_start.unwrap_or(0)
    }

    pub fn allowed_end(&self) -> u32 {
        self.fields
            .allowed_time_minutes_end
            .unwrap_or(MINUTES_PER_DAY)
    }

    pub fn is_full_day(&self) -> bool {
        self.allowed_start() == 0 && self.allowed_end() == MINUTES_PER_DAY
    }

    /// True when both date bounds are whole days.
    pub fn is_day_aligned(&self) -> bool {
        self.date_minutes_start() % MINUTES_PER_DAY == 0
            && self.date_minutes_end() % MINUTES_PER_DAY == 0
    }

    /// Draw the next run instant relative to the local wall clock.
    pub fn next_run(&self) -> DateTime<Utc> {
        self.next_run_after(Local::now(), &mut rand::thread_rng())
            .with_timezone(&Utc)
    }

    /// Draw the next run instant after `now`, interpreting the allowed time
    /// window in `now`'s time zone.
    pub fn next_run_after<Tz: TimeZone, R: Rng + ?Sized>(
        &self,
        now: DateTime<Tz>,
        rng: &mut R,
    ) -> DateTime<Tz> {
        let offset = rng.gen_range(self.date_minutes_start()..=self.date_minutes_end());
        let drawn = now + Duration::minutes(i64::from(offset));

        if !self.is_day_aligned() {
            return drawn;
        }

        let minute_of_day = rng.gen_range(self.allowed_start()..=self.allowed_end());
        let naive = drawn.date_naive().and_time(NaiveTime::MIN)
            + Duration::minutes(i64::from(minute_of_day));
        let tz = drawn.timezone();

        // A local time inside a DST gap does not exist; slide past the gap.
        tz.from_local_datetime(&naive)
            .earliest()
            .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .unwrap_or(drawn)
    }
}

impl TryFrom<PolicyFields> for SchedulePolicy {
    type Error = PolicyError;

    fn try_from(fields: PolicyFields) -> Result<Self, Self::Error> {
        let policy = Self { fields };

        let (start, end) = (policy.date_minutes_start(), policy.date_minutes_end());
        if start > end {
            return Err(PolicyError::DateRangeInverted { start, end });
        }

        let (allowed_start, allowed_end) = (policy.allowed_start(), policy.allowed_end());
        if allowed_start > allowed_end {
            return Err(PolicyError::TimeRangeInverted {
                start: allowed_start,
                end: allowed_end,
            });
        }
        if allowed_end > MINUTES_PER_DAY {
            return Err(PolicyError::TimeOutOfDay { end: allowed_end });
        }

        if !policy.is_full_day() {
            if start % MINUTES_PER_DAY != 0 {
                return Err(PolicyError::NotDayAligned {
                    field: "date_minutes_start",
                    value: start,
                });
            }
            if end % MINUTES_PER_DAY != 0 {
                return Err(PolicyError::NotDayAligned {
                    field: "date_minutes_end",
                    value: end,
                });
            }
        }

        Ok(policy)
    }
}

impl From<SchedulePolicy> for PolicyFields {
    fn from(policy: SchedulePolicy) -> Self {
        policy.fields
    }
}

//! Recurring schedules and time-zone-aware next-due computation.
//!
//! Every interval form is evaluated in the schedule's named time zone and the
//! result converted to UTC on each call, so daylight-saving transitions are
//! tracked instead of baked into a cached offset.
//!
//! Civil times that do not map to exactly one instant are resolved as follows:
//!
//! - ambiguous (fall-back, the hour repeats): the earliest instant, so the
//!   occurrence runs once
//! - nonexistent (spring-forward gap): shifted forward by the gap length,
//!   so 02:00 in a 02:00-03:00 gap runs at 03:00

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Days, LocalResult, NaiveDateTime, NaiveTime, Offset, TimeDelta, TimeZone,
    Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::MonitoredSource;

/// Cadences accepted by [`IntervalSpec::Hourly`]; each divides a day evenly.
pub const HOURLY_CADENCES: [u32; 7] = [1, 2, 3, 4, 6, 8, 12];

/// The recurrence rule of a schedule, expressed in civil (wall-clock) time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalSpec {
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Every `every` hours at `minute`, aligned to local midnight.
    Hourly {
        every: u32,
        minute: u32,
    },
    /// Seconds-first cron expression, e.g. `0 15 */6 * * Mon-Fri`.
    Cron {
        expression: String,
    },
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalSpec::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            IntervalSpec::Weekly {
                weekday,
                hour,
                minute,
            } => write!(f, "weekly on {weekday} at {hour:02}:{minute:02}"),
            IntervalSpec::Hourly { every: 1, minute } => write!(f, "hourly at :{minute:02}"),
            IntervalSpec::Hourly { every, minute } => {
                write!(f, "every {every} hours at :{minute:02}")
            }
            IntervalSpec::Cron { expression } => write!(f, "cron '{expression}'"),
        }
    }
}

/// An interval plus the time zone its civil times are expressed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub interval: IntervalSpec,
    pub timezone: Tz,
}

impl ScheduleSpec {
    pub fn new(interval: IntervalSpec, timezone: Tz) -> Self {
        Self { interval, timezone }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        match &self.interval {
            IntervalSpec::Daily { hour, minute } | IntervalSpec::Weekly { hour, minute, .. } => {
                civil_time(*hour, *minute).map(|_| ())
            }
            IntervalSpec::Hourly { every, minute } => {
                if !HOURLY_CADENCES.contains(every) {
                    return Err(AppError::Schedule(format!(
                        "hourly cadence must be one of {HOURLY_CADENCES:?}, got {every}"
                    )));
                }
                civil_time(0, *minute).map(|_| ())
            }
            IntervalSpec::Cron { expression } => parse_cron(expression).map(|_| ()),
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let tz = self.timezone;
        let local = after.with_timezone(&tz).naive_local();

        let found = match &self.interval {
            IntervalSpec::Daily { hour, minute } => {
                let time = civil_time(*hour, *minute)?;
                first_after(
                    tz,
                    after,
                    (0..=2).filter_map(|d| local.date().checked_add_days(Days::new(d))),
                    time,
                )
            }
            IntervalSpec::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let time = civil_time(*hour, *minute)?;
                first_after(
                    tz,
                    after,
                    (0..=14)
                        .filter_map(|d| local.date().checked_add_days(Days::new(d)))
                        .filter(|date| date.weekday() == *weekday),
                    time,
                )
            }
            IntervalSpec::Hourly { every, minute } => {
                self.validate()?;
                let top_of_hour = local
                    .date()
                    .and_hms_opt(local.hour(), 0, 0)
                    .ok_or_else(|| AppError::Schedule("invalid local hour".into()))?;
                (0..=50)
                    .map(|h| top_of_hour + TimeDelta::hours(h))
                    .filter(|slot| slot.hour() % every == 0)
                    .filter_map(|slot| slot.with_minute(*minute))
                    .filter_map(|slot| resolve_local(tz, slot))
                    .find(|t| *t > after)
            }
            IntervalSpec::Cron { expression } => parse_cron(expression)?
                .after(&after.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        };

        found.ok_or_else(|| {
            AppError::Schedule(format!(
                "no occurrence of {} ({}) after {after}",
                self.interval, self.timezone
            ))
        })
    }

    /// Next due instant after a run that was due at `previous_due`.
    ///
    /// Advances from `previous_due` so a late tick does not drift the
    /// schedule; if that occurrence is already in the past, skips ahead to
    /// the first occurrence strictly after `now` instead of replaying the
    /// missed windows.
    pub fn advance(
        &self,
        previous_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AppError> {
        let next = self.next_after(previous_due)?;
        if next > now {
            Ok(next)
        } else {
            self.next_after(now)
        }
    }
}

fn civil_time(hour: u32, minute: u32) -> Result<NaiveTime, AppError> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::Schedule(format!("invalid civil time {hour:02}:{minute:02}")))
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, AppError> {
    cron::Schedule::from_str(expression)
        .map_err(|e| AppError::Schedule(format!("invalid cron expression '{expression}': {e}")))
}

fn first_after(
    tz: Tz,
    after: DateTime<Utc>,
    dates: impl Iterator<Item = chrono::NaiveDate>,
    time: NaiveTime,
) -> Option<DateTime<Utc>> {
    dates
        .filter_map(|date| resolve_local(tz, date.and_time(time)))
        .find(|t| *t > after)
}

/// Map a civil time in `tz` to the single UTC instant it is scheduled at.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            // Inside a gap: keep the offset in force before the transition.
            let before = tz
                .from_local_datetime(&(naive - TimeDelta::hours(3)))
                .earliest()?;
            let offset = i64::from(before.offset().fix().local_minus_utc());
            Some(Utc.from_utc_datetime(&(naive - TimeDelta::seconds(offset))))
        }
    }
}

/// Render a UTC timestamp for operators in the display time zone.
pub fn render_in(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string()
}

/// One recurring trigger bound to a monitored source.
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: Uuid,
    pub source_id: String,
    pub spec: ScheduleSpec,
    pub enabled: bool,
    pub next_due_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Set while a scheduled attempt for this schedule holds the source claim.
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub claim_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn is_claimed(&self, now: DateTime<Utc>, stale_after: TimeDelta) -> bool {
        self.last_claimed_at
            .is_some_and(|claimed| now - claimed < stale_after)
    }

    pub fn is_due(
        &self,
        source: &MonitoredSource,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> bool {
        self.enabled
            && source.is_runnable()
            && self.next_due_at <= now
            && !self.is_claimed(now, stale_after)
    }
}

/// Request to create a schedule.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub source_id: String,
    pub spec: ScheduleSpec,
    pub enabled: bool,
}

impl NewSchedule {
    pub fn new(source_id: impl Into<String>, spec: ScheduleSpec) -> Self {
        Self {
            source_id: source_id.into(),
            spec,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Validates the spec and computes the first `next_due_at`.
    pub fn first_due(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        self.spec.validate()?;
        self.spec.next_after(now)
    }
}

/// A due schedule together with the source it runs.
#[derive(Debug, Clone)]
pub struct DueSchedule {
    pub schedule: Schedule,
    pub source: MonitoredSource,
}

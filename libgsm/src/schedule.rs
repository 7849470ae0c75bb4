use std::fmt;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, Timelike};

use crate::error::{LifecycleError, Result};

/// Kind of periodic work the scheduler can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Update,
    Backup,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Update => f.write_str("update"),
            TaskKind::Backup => f.write_str("backup"),
        }
    }
}

/// One periodic task, built from configuration at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub kind: TaskKind,
    pub schedule: CronSchedule,
    pub only_if_idle: bool,
}

impl ScheduleEntry {
    pub fn new(kind: TaskKind, expression: &str, only_if_idle: bool) -> Result<Self> {
        Ok(Self {
            kind,
            schedule: CronSchedule::parse(expression)?,
            only_if_idle,
        })
    }
}

/// A parsed 5-field cron expression (`minute hour day-of-month month day-of-week`).
///
/// Each field accepts `*`, single values, `a-b` ranges, `/n` steps and comma lists.
/// The `@hourly`, `@daily`, `@weekly`, `@monthly` and `@yearly` shorthands are also accepted.
/// Fields are stored as bitsets so matching a candidate minute is a handful of shifts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
    raw: String,
}

impl CronSchedule {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let lowered = trimmed.to_ascii_lowercase();
        let expr = match lowered.as_str() {
            "@hourly" | "hourly" => "0 * * * *",
            "@daily" | "@midnight" | "daily" => "0 0 * * *",
            "@weekly" | "weekly" => "0 0 * * 0",
            "@monthly" | "monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            _ => trimmed,
        };

        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(LifecycleError::Config(format!(
                "cron expression '{trimmed}' must have 5 fields"
            )));
        }

        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        let days_of_month = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?;
        let mut days_of_week = parse_field(parts[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
            raw: trimmed.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, candidate: DateTime<Local>) -> bool {
        if !bit(self.minutes, candidate.minute())
            || !bit(self.hours, candidate.hour())
            || !bit(self.months, candidate.month())
        {
            return false;
        }

        let dom = bit(self.days_of_month, candidate.day());
        let dow = bit(self.days_of_week, candidate.weekday().num_days_from_sunday());
        // Classic cron: when both day fields are restricted either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First matching minute strictly after `now`, or `None` if nothing matches within a year
    /// (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let start = now.with_second(0)?.with_nanosecond(0)?;
        let max_minutes = 366_i64 * 24 * 60;
        (1..=max_minutes)
            .map(|offset| start + ChronoDuration::minutes(offset))
            .find(|candidate| self.matches(*candidate))
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<u64> {
    let invalid = |why: &str| LifecycleError::Config(format!("invalid cron field '{raw}': {why}"));
    let number = |s: &str| -> Result<u32> {
        s.parse::<u32>()
            .map_err(|_| invalid(&format!("'{s}' is not a number")))
    };

    let mut set = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = number(step)?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (number(a)?, number(b)?)
        } else {
            let value = number(range)?;
            // `5/15` means "from 5 to the end in steps of 15".
            if step.is_some() { (value, max) } else { (value, value) }
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(&format!("out of range ({min}-{max})")));
        }
        for value in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
            set |= 1u64 << value;
        }
    }
    Ok(set)
}

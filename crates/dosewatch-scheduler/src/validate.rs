//! Boundary validation for reminder input. The compiler assumes its input
//! already passed these checks.

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::schedule::{derive_end_date, in_supported_range};
use crate::types::{Course, Frequency, ReminderInput};

/// Longest accepted interval between doses.
pub const MAX_INTERVAL_HOURS: u32 = 366 * 24;

/// Validate `input` against the recurrence contract, given the effective start date.
pub fn validate(input: &ReminderInput, start: DateTime<Utc>) -> Result<()> {
    if input.medicine_name.trim().is_empty() {
        return Err(invalid("medicine_name must not be empty"));
    }
    if input.dosage.trim().is_empty() {
        return Err(invalid("dosage must not be empty"));
    }
    check_timestamp("start_date", start)?;
    validate_frequency(&input.frequency)?;
    validate_course(&input.course, start)
}

/// Reject instants outside the years 1970..=9999.
pub fn check_timestamp(field: &str, t: DateTime<Utc>) -> Result<()> {
    if in_supported_range(t) {
        Ok(())
    } else {
        Err(invalid(format!("{field} {t} is outside the years 1970..=9999")))
    }
}

fn validate_frequency(frequency: &Frequency) -> Result<()> {
    match frequency {
        Frequency::Once { at } => check_timestamp("at", *at),
        Frequency::NTimesDaily { times } => {
            if times.is_empty() {
                return Err(invalid("N_TIMES_DAILY requires at least one HH:MM time"));
            }
            Ok(())
        }
        Frequency::EveryNHours { n } | Frequency::EveryNMinutes { n } => {
            if *n == 0 {
                return Err(invalid(format!(
                    "{} requires a positive interval",
                    frequency.kind()
                )));
            }
            let max = match frequency {
                Frequency::EveryNHours { .. } => MAX_INTERVAL_HOURS,
                _ => MAX_INTERVAL_HOURS * 60,
            };
            if *n > max {
                return Err(invalid(format!(
                    "{} interval {n} exceeds {max}",
                    frequency.kind()
                )));
            }
            Ok(())
        }
        Frequency::SpecificWeekdays { days, times } => {
            if days.is_empty() {
                return Err(invalid("SPECIFIC_WEEKDAYS requires at least one weekday"));
            }
            if let Some(bad) = days.iter().find(|d| **d > 6) {
                return Err(invalid(format!("weekday {bad} is outside 0..=6")));
            }
            if times.is_empty() {
                return Err(invalid("SPECIFIC_WEEKDAYS requires at least one HH:MM time"));
            }
            Ok(())
        }
        Frequency::SpecificDayOfMonth { day, times } => {
            if !(1..=31).contains(day) {
                return Err(invalid(format!("day of month {day} is outside 1..=31")));
            }
            if times.is_empty() {
                return Err(invalid(
                    "SPECIFIC_DAY_OF_MONTH requires at least one HH:MM time",
                ));
            }
            Ok(())
        }
    }
}

fn validate_course(course: &Course, start: DateTime<Utc>) -> Result<()> {
    match course {
        Course::Continuous => Ok(()),
        Course::ForNDays { n } | Course::ForNWeeks { n } | Course::ForNMonths { n } => {
            if *n == 0 {
                return Err(invalid(format!("{} requires a positive count", course.kind())));
            }
            match derive_end_date(course, start) {
                Some(end) => check_timestamp("end of course", end),
                None => Err(invalid(format!("{} count {n} is too large", course.kind()))),
            }
        }
        Course::UntilDate { until } => {
            check_timestamp("until", *until)?;
            if *until <= start {
                return Err(invalid("UNTIL_DATE must be strictly after start_date"));
            }
            Ok(())
        }
    }
}

fn invalid(msg: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidSpec(msg.into())
}

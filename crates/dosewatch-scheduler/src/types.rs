use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use dosewatch_core::{OwnerId, ReminderId};
use serde::{Deserialize, Serialize};

/// Wall-clock time of day (UTC), written `HH:MM` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(format!("expected HH:MM, got {s:?}"));
        }
        let hour: u8 = h.parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute: u8 = m.parse().map_err(|_| format!("bad minute in {s:?}"))?;
        TimeOfDay::new(hour, minute).ok_or_else(|| format!("time out of range: {s:?}"))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

/// How often a reminder recurs.
///
/// Weekdays are numbered 0 = Sunday … 6 = Saturday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    /// Fire exactly once at an absolute instant.
    Once { at: DateTime<Utc> },
    /// Fire every day at each listed wall-clock time.
    NTimesDaily { times: Vec<TimeOfDay> },
    /// Fire every `n` hours, anchored at the start date.
    EveryNHours { n: u32 },
    /// Fire every `n` minutes, anchored at the start date.
    EveryNMinutes { n: u32 },
    /// Fire on the listed weekdays at each listed time.
    SpecificWeekdays { days: Vec<u8>, times: Vec<TimeOfDay> },
    /// Fire once per month on `day` (clamped to the month's last day) at each listed time.
    SpecificDayOfMonth { day: u8, times: Vec<TimeOfDay> },
}

impl Frequency {
    pub fn kind(&self) -> &'static str {
        match self {
            Frequency::Once { .. } => "ONCE",
            Frequency::NTimesDaily { .. } => "N_TIMES_DAILY",
            Frequency::EveryNHours { .. } => "EVERY_N_HOURS",
            Frequency::EveryNMinutes { .. } => "EVERY_N_MINUTES",
            Frequency::SpecificWeekdays { .. } => "SPECIFIC_WEEKDAYS",
            Frequency::SpecificDayOfMonth { .. } => "SPECIFIC_DAY_OF_MONTH",
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, Frequency::Once { .. })
    }
}

/// How long a reminder keeps recurring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Course {
    #[default]
    Continuous,
    ForNDays { n: u32 },
    ForNWeeks { n: u32 },
    ForNMonths { n: u32 },
    UntilDate { until: DateTime<Utc> },
}

impl Course {
    pub fn kind(&self) -> &'static str {
        match self {
            Course::Continuous => "CONTINUOUS",
            Course::ForNDays { .. } => "FOR_N_DAYS",
            Course::ForNWeeks { .. } => "FOR_N_WEEKS",
            Course::ForNMonths { .. } => "FOR_N_MONTHS",
            Course::UntilDate { .. } => "UNTIL_DATE",
        }
    }
}

/// Create/update payload as accepted from the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderInput {
    pub medicine_name: String,
    pub dosage: String,
    pub frequency: Frequency,
    #[serde(default)]
    pub course: Course,
    /// Defaults to the creation time.
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
}

/// Lifecycle of a reminder. `Completed` and `Cancelled` are terminal for firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderStatus {
    Active,
    Completed,
    Cancelled,
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReminderStatus::Active => "active",
            ReminderStatus::Completed => "completed",
            ReminderStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(ReminderStatus::Active),
            "completed" => Ok(ReminderStatus::Completed),
            "cancelled" => Ok(ReminderStatus::Cancelled),
            other => Err(format!("unknown reminder status: {other}")),
        }
    }
}

/// A persisted reminder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    /// UUIDv7, primary key.
    pub id: ReminderId,
    /// Immutable after creation.
    pub owner_id: OwnerId,
    pub medicine_name: String,
    pub dosage: String,
    pub frequency: Frequency,
    pub course: Course,
    pub start_date: DateTime<Utc>,
    /// Derived from `course`; `None` for continuous reminders.
    pub end_date: Option<DateTime<Utc>>,
    pub status: ReminderStatus,
    /// Earliest pending trigger, if any.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Written only by the execution runner.
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_taken_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    /// Notification text sent when a dose is due.
    pub fn message(&self) -> String {
        format!("Time to take {} ({})", self.medicine_name, self.dosage)
    }
}

/// Outcome of one due dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdherenceStatus {
    /// Due and not yet acknowledged.
    Scheduled,
    Taken,
    Missed,
    Skipped,
}

impl fmt::Display for AdherenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdherenceStatus::Scheduled => "scheduled",
            AdherenceStatus::Taken => "taken",
            AdherenceStatus::Missed => "missed",
            AdherenceStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AdherenceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(AdherenceStatus::Scheduled),
            "taken" => Ok(AdherenceStatus::Taken),
            "missed" => Ok(AdherenceStatus::Missed),
            "skipped" => Ok(AdherenceStatus::Skipped),
            other => Err(format!("unknown adherence status: {other}")),
        }
    }
}

/// One row per fired trigger instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdherenceRecord {
    pub id: String,
    /// The trigger this record was written for; unique across records.
    pub trigger_id: String,
    pub reminder_id: ReminderId,
    pub owner_id: OwnerId,
    pub scheduled_time: DateTime<Utc>,
    /// Always >= `scheduled_time` when set.
    pub taken_time: Option<DateTime<Utc>>,
    pub status: AdherenceStatus,
    pub created_at: DateTime<Utc>,
}

/// A trigger instant claimed by one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTrigger {
    pub trigger_id: String,
    pub reminder_id: ReminderId,
    pub rule_index: usize,
    pub due_at: DateTime<Utc>,
    pub claimed_by: String,
    /// Reminder status at claim time; `None` when the reminder no longer exists.
    pub reminder_status: Option<ReminderStatus>,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(self.limit as u64)
    }
}

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, SubsecRound, Utc};
use dosewatch_core::ReminderId;
use serde::{Deserialize, Serialize};

use crate::types::{Course, Frequency, Reminder, TimeOfDay};

/// A single trigger-generating rule. A compiled schedule holds one or more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    /// Exactly one instant.
    At { at: DateTime<Utc> },
    /// `anchor`, `anchor + every`, `anchor + 2*every`, …
    Interval { anchor: DateTime<Utc>, every_secs: i64 },
    /// Every day at `time`, optionally restricted to weekdays (0 = Sunday).
    Daily {
        time: TimeOfDay,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weekdays: Option<Vec<u8>>,
    },
    /// Once per month on `day` at `time`. Months shorter than `day` fire on their last day.
    Monthly { day: u8, time: TimeOfDay },
}

impl Rule {
    /// Earliest instant produced by this rule that is `>= from`.
    ///
    /// Returns `None` when the rule is exhausted (an `At` rule whose instant
    /// has passed).
    pub fn next_at_or_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Rule::At { at } => (*at >= from).then_some(*at),

            Rule::Interval { anchor, every_secs } => {
                if from <= *anchor {
                    return Some(*anchor);
                }
                let every = (*every_secs).max(1);
                let steps = (from - *anchor).num_seconds() / every;
                let candidate =
                    anchor.checked_add_signed(Duration::try_seconds(steps * every)?)?;
                if candidate >= from {
                    Some(candidate)
                } else {
                    candidate.checked_add_signed(Duration::try_seconds(every)?)
                }
            }

            Rule::Daily { time, weekdays } => {
                let mut day = from.date_naive();
                // Eight days covers every weekday set, including today's window having passed.
                for _ in 0..8 {
                    let candidate = day.and_time(time.to_naive()).and_utc();
                    let weekday = day.weekday().num_days_from_sunday() as u8;
                    let allowed = match weekdays {
                        Some(days) => days.contains(&weekday),
                        None => true,
                    };
                    if candidate >= from && allowed {
                        return Some(candidate);
                    }
                    day = day.succ_opt()?;
                }
                None
            }

            Rule::Monthly { day, time } => {
                let (mut year, mut month) = (from.year(), from.month());
                for _ in 0..3 {
                    let dom = (*day as u32).clamp(1, days_in_month(year, month));
                    let candidate = NaiveDate::from_ymd_opt(year, month, dom)?
                        .and_time(time.to_naive())
                        .and_utc();
                    if candidate >= from {
                        return Some(candidate);
                    }
                    (year, month) = next_month(year, month);
                }
                None
            }
        }
    }

    /// Earliest instant strictly after `after`. Instants have whole-second precision.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = after.trunc_subsecs(0).checked_add_signed(Duration::seconds(1))?;
        self.next_at_or_after(from)
    }
}

/// Whether `t` lies in the years 1970..=9999, the range stored timestamps
/// can take while keeping their fixed-width encoding.
pub fn in_supported_range(t: DateTime<Utc>) -> bool {
    (1970..=9999).contains(&t.year())
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    NaiveDate::from_ymd_opt(ny, nm, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Rule set derived from a reminder. Rebuilt on every mutation, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSchedule {
    pub reminder_id: ReminderId,
    pub rules: Vec<Rule>,
    /// No instant earlier than this is ever produced.
    pub start: DateTime<Utc>,
    /// Exclusive: no instant at or after this is ever produced.
    pub end: Option<DateTime<Utc>>,
    /// Earliest instant still pending at compile time.
    pub next_due_at: Option<DateTime<Utc>>,
}

impl CompiledSchedule {
    /// Rebuild from stored parts (used by the job store when advancing a rule).
    pub fn from_parts(
        reminder_id: ReminderId,
        rules: Vec<Rule>,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            reminder_id,
            rules,
            start,
            end,
            next_due_at: None,
        }
    }

    fn within_end(&self, t: DateTime<Utc>) -> bool {
        in_supported_range(t) && self.end.map_or(true, |end| t < end)
    }

    fn bounded(&self, t: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        t.filter(|t| self.within_end(*t))
    }

    fn lower_bound(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        self.start.max(from.trunc_subsecs(0))
    }

    /// First instant of each rule at or after `now`, as `(rule_index, instant)`.
    /// Exhausted rules are omitted.
    pub fn pending(&self, now: DateTime<Utc>) -> Vec<(usize, DateTime<Utc>)> {
        let from = self.lower_bound(now);
        self.rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| self.bounded(rule.next_at_or_after(from)).map(|t| (i, t)))
            .collect()
    }

    /// Next instant of rule `rule_index` after a claimed `due_at`.
    ///
    /// Measured from `max(due_at, now)`, so a backlog accumulated while no
    /// scheduler was running collapses into the single instant already claimed.
    pub fn successor(
        &self,
        rule_index: usize,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let rule = self.rules.get(rule_index)?;
        let after = due_at.max(now).max(self.start);
        self.bounded(rule.next_after(after))
    }

    /// All instants `>= from` in chronological order, merged across rules
    /// and deduplicated. Unbounded for continuous reminders; callers `take`.
    pub fn instants(&self, from: DateTime<Utc>) -> Instants<'_> {
        let from = self.lower_bound(from);
        let heads = self
            .rules
            .iter()
            .map(|rule| self.bounded(rule.next_at_or_after(from)))
            .collect();
        Instants {
            schedule: self,
            heads,
            last: None,
        }
    }
}

/// Lazy iterator over a schedule's trigger instants.
pub struct Instants<'a> {
    schedule: &'a CompiledSchedule,
    heads: Vec<Option<DateTime<Utc>>>,
    last: Option<DateTime<Utc>>,
}

impl Iterator for Instants<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, t) = self
                .heads
                .iter()
                .enumerate()
                .filter_map(|(i, h)| h.map(|t| (i, t)))
                .min_by_key(|(_, t)| *t)?;
            let rule = &self.schedule.rules[idx];
            self.heads[idx] = self.schedule.bounded(rule.next_after(t));
            if self.last == Some(t) {
                continue;
            }
            self.last = Some(t);
            return Some(t);
        }
    }
}

/// End of the reminder's course, or `None` for continuous reminders.
///
/// Month arithmetic clamps to the last valid day (31 Jan + 1 month = end of Feb).
/// A count too large to represent also yields `None`; validation rejects it first.
pub fn derive_end_date(course: &Course, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match course {
        Course::Continuous => None,
        Course::ForNDays { n } => start.checked_add_days(Days::new(*n as u64)),
        Course::ForNWeeks { n } => start.checked_add_days(Days::new(*n as u64 * 7)),
        Course::ForNMonths { n } => start.checked_add_months(Months::new(*n)),
        Course::UntilDate { until } => Some(*until),
    }
}

/// Rules for a frequency. Duplicate times and weekdays collapse.
pub fn rules_for(frequency: &Frequency, start: DateTime<Utc>) -> Vec<Rule> {
    match frequency {
        Frequency::Once { at } => vec![Rule::At {
            at: at.trunc_subsecs(0),
        }],
        Frequency::EveryNHours { n } => vec![Rule::Interval {
            anchor: start,
            every_secs: *n as i64 * 3600,
        }],
        Frequency::EveryNMinutes { n } => vec![Rule::Interval {
            anchor: start,
            every_secs: *n as i64 * 60,
        }],
        Frequency::NTimesDaily { times } => sorted(times)
            .into_iter()
            .map(|time| Rule::Daily {
                time,
                weekdays: None,
            })
            .collect(),
        Frequency::SpecificWeekdays { days, times } => {
            let mut days = days.clone();
            days.sort_unstable();
            days.dedup();
            sorted(times)
                .into_iter()
                .map(|time| Rule::Daily {
                    time,
                    weekdays: Some(days.clone()),
                })
                .collect()
        }
        Frequency::SpecificDayOfMonth { day, times } => sorted(times)
            .into_iter()
            .map(|time| Rule::Monthly { day: *day, time })
            .collect(),
    }
}

fn sorted(times: &[TimeOfDay]) -> Vec<TimeOfDay> {
    let mut times = times.to_vec();
    times.sort_unstable();
    times.dedup();
    times
}

/// Compile `reminder` into its rule set as seen from `now`.
///
/// Pure: the same reminder and `now` always give the same schedule.
/// Instants before `now` or `start_date`, or after `end_date`, are never produced.
pub fn compile(reminder: &Reminder, now: DateTime<Utc>) -> CompiledSchedule {
    let start = reminder.start_date.trunc_subsecs(0);
    let mut schedule = CompiledSchedule::from_parts(
        reminder.id.clone(),
        rules_for(&reminder.frequency, start),
        start,
        reminder.end_date,
    );
    schedule.next_due_at = schedule.instants(now).next();
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReminderStatus;
    use chrono::TimeZone;
    use dosewatch_core::OwnerId;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn at(h: u8, m: u8) -> TimeOfDay {
        TimeOfDay::new(h, m).unwrap()
    }

    fn reminder(frequency: Frequency, course: Course, start: DateTime<Utc>) -> Reminder {
        Reminder {
            id: ReminderId::from("r-1"),
            owner_id: OwnerId::from("u-1"),
            medicine_name: "Metformin".into(),
            dosage: "500mg".into(),
            end_date: derive_end_date(&course, start),
            frequency,
            course,
            start_date: start,
            status: ReminderStatus::Active,
            next_due_at: None,
            last_fired_at: None,
            last_taken_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn twice_daily_for_three_days_yields_six_instants() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::NTimesDaily {
                times: vec![at(8, 0), at(20, 0)],
            },
            Course::ForNDays { n: 3 },
            start,
        );
        assert_eq!(r.end_date, Some(utc(2025, 1, 4, 0, 0)));

        let schedule = compile(&r, start);
        assert_eq!(schedule.rules.len(), 2);
        let instants: Vec<_> = schedule.instants(start).take(100).collect();
        assert_eq!(
            instants,
            vec![
                utc(2025, 1, 1, 8, 0),
                utc(2025, 1, 1, 20, 0),
                utc(2025, 1, 2, 8, 0),
                utc(2025, 1, 2, 20, 0),
                utc(2025, 1, 3, 8, 0),
                utc(2025, 1, 3, 20, 0),
            ]
        );
        assert_eq!(schedule.next_due_at, Some(utc(2025, 1, 1, 8, 0)));
    }

    #[test]
    fn elapsed_instants_are_never_included() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::NTimesDaily {
                times: vec![at(20, 0), at(8, 0)],
            },
            Course::ForNDays { n: 3 },
            start,
        );
        let now = utc(2025, 1, 2, 12, 0);
        let schedule = compile(&r, now);
        assert_eq!(schedule.next_due_at, Some(utc(2025, 1, 2, 20, 0)));
        assert_eq!(schedule.instants(now).count(), 3);
    }

    #[test]
    fn compile_is_deterministic() {
        let start = utc(2025, 3, 10, 7, 15);
        let now = utc(2025, 3, 11, 9, 0);
        let frequencies = [
            Frequency::Once {
                at: utc(2025, 4, 1, 9, 0),
            },
            Frequency::EveryNHours { n: 6 },
            Frequency::EveryNMinutes { n: 45 },
            Frequency::NTimesDaily {
                times: vec![at(8, 0), at(14, 0), at(22, 0)],
            },
            Frequency::SpecificWeekdays {
                days: vec![5, 1, 3],
                times: vec![at(9, 30)],
            },
            Frequency::SpecificDayOfMonth {
                day: 31,
                times: vec![at(10, 0)],
            },
        ];
        for f in frequencies {
            let r = reminder(f, Course::ForNMonths { n: 2 }, start);
            let a = compile(&r, now);
            let b = compile(&r, now);
            assert_eq!(a, b);
            let ia: Vec<_> = a.instants(now).take(20).collect();
            let ib: Vec<_> = b.instants(now).take(20).collect();
            assert_eq!(ia, ib);
        }
    }

    #[test]
    fn day_31_clamps_to_last_day_of_short_months() {
        let rule = Rule::Monthly {
            day: 31,
            time: at(9, 0),
        };
        // April has 30 days: fire on the 30th, not skip to May or roll into 1 May.
        assert_eq!(
            rule.next_at_or_after(utc(2025, 4, 1, 0, 0)),
            Some(utc(2025, 4, 30, 9, 0))
        );
        assert_eq!(
            rule.next_at_or_after(utc(2025, 2, 1, 0, 0)),
            Some(utc(2025, 2, 28, 9, 0))
        );
        assert_eq!(
            rule.next_at_or_after(utc(2024, 2, 1, 0, 0)),
            Some(utc(2024, 2, 29, 9, 0))
        );
        assert_eq!(
            rule.next_after(utc(2025, 4, 30, 9, 0)),
            Some(utc(2025, 5, 31, 9, 0))
        );
    }

    #[test]
    fn monthly_sequence_visits_every_month() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::SpecificDayOfMonth {
                day: 31,
                times: vec![at(9, 0)],
            },
            Course::Continuous,
            start,
        );
        let months: Vec<_> = compile(&r, start)
            .instants(start)
            .take(12)
            .map(|t| (t.month(), t.day()))
            .collect();
        assert_eq!(
            months,
            vec![
                (1, 31),
                (2, 28),
                (3, 31),
                (4, 30),
                (5, 31),
                (6, 30),
                (7, 31),
                (8, 31),
                (9, 30),
                (10, 31),
                (11, 30),
                (12, 31)
            ]
        );
    }

    #[test]
    fn weekday_rule_skips_other_days() {
        // 2025-01-01 is a Wednesday.
        let rule = Rule::Daily {
            time: at(9, 0),
            weekdays: Some(vec![1, 3]),
        };
        let start = utc(2025, 1, 1, 0, 0);
        assert_eq!(rule.next_at_or_after(start), Some(utc(2025, 1, 1, 9, 0)));
        assert_eq!(
            rule.next_after(utc(2025, 1, 1, 9, 0)),
            Some(utc(2025, 1, 6, 9, 0))
        );
        assert_eq!(
            rule.next_after(utc(2025, 1, 6, 9, 0)),
            Some(utc(2025, 1, 8, 9, 0))
        );
    }

    #[test]
    fn weekday_reminder_with_several_times() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::SpecificWeekdays {
                days: vec![0],
                times: vec![at(21, 0), at(7, 0)],
            },
            Course::ForNWeeks { n: 2 },
            start,
        );
        let instants: Vec<_> = compile(&r, start).instants(start).collect();
        assert_eq!(
            instants,
            vec![
                utc(2025, 1, 5, 7, 0),
                utc(2025, 1, 5, 21, 0),
                utc(2025, 1, 12, 7, 0),
                utc(2025, 1, 12, 21, 0),
            ]
        );
    }

    #[test]
    fn interval_is_anchored_at_start() {
        let rule = Rule::Interval {
            anchor: utc(2025, 1, 1, 8, 0),
            every_secs: 4 * 3600,
        };
        assert_eq!(
            rule.next_at_or_after(utc(2024, 12, 31, 0, 0)),
            Some(utc(2025, 1, 1, 8, 0))
        );
        assert_eq!(
            rule.next_at_or_after(utc(2025, 1, 1, 13, 0)),
            Some(utc(2025, 1, 1, 16, 0))
        );
        assert_eq!(
            rule.next_at_or_after(utc(2025, 1, 1, 16, 0)),
            Some(utc(2025, 1, 1, 16, 0))
        );
        assert_eq!(
            rule.next_after(utc(2025, 1, 1, 16, 0)),
            Some(utc(2025, 1, 1, 20, 0))
        );
    }

    #[test]
    fn once_has_exactly_one_instant() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::Once {
                at: utc(2025, 1, 2, 12, 0),
            },
            Course::Continuous,
            start,
        );
        let schedule = compile(&r, start);
        assert_eq!(schedule.instants(start).count(), 1);
        assert!(compile(&r, utc(2025, 1, 3, 0, 0)).next_due_at.is_none());
    }

    #[test]
    fn successor_collapses_backlog() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(Frequency::EveryNHours { n: 1 }, Course::Continuous, start);
        let schedule = compile(&r, start);
        // Claimed the 01:00 instant at 05:30 after downtime: next is 06:00, not 02:00.
        assert_eq!(
            schedule.successor(0, utc(2025, 1, 1, 1, 0), utc(2025, 1, 1, 5, 30)),
            Some(utc(2025, 1, 1, 6, 0))
        );
        assert_eq!(
            schedule.successor(0, utc(2025, 1, 1, 1, 0), utc(2025, 1, 1, 1, 0)),
            Some(utc(2025, 1, 1, 2, 0))
        );
        assert_eq!(schedule.successor(7, start, start), None);
    }

    #[test]
    fn successor_respects_end_date() {
        let start = utc(2025, 1, 1, 0, 0);
        let r = reminder(
            Frequency::NTimesDaily {
                times: vec![at(8, 0)],
            },
            Course::ForNDays { n: 2 },
            start,
        );
        let schedule = compile(&r, start);
        assert_eq!(
            schedule.successor(0, utc(2025, 1, 1, 8, 0), utc(2025, 1, 1, 8, 0)),
            Some(utc(2025, 1, 2, 8, 0))
        );
        assert_eq!(
            schedule.successor(0, utc(2025, 1, 2, 8, 0), utc(2025, 1, 2, 8, 0)),
            None
        );
    }

    #[test]
    fn course_end_is_exclusive() {
        let start = utc(2025, 1, 1, 8, 0);
        let r = reminder(
            Frequency::EveryNHours { n: 24 },
            Course::ForNDays { n: 3 },
            start,
        );
        let instants: Vec<_> = compile(&r, start).instants(start).collect();
        assert_eq!(
            instants,
            vec![start, utc(2025, 1, 2, 8, 0), utc(2025, 1, 3, 8, 0)]
        );
    }

    #[test]
    fn course_end_dates() {
        let start = utc(2025, 1, 31, 9, 0);
        assert_eq!(derive_end_date(&Course::Continuous, start), None);
        assert_eq!(
            derive_end_date(&Course::ForNDays { n: 3 }, start),
            Some(utc(2025, 2, 3, 9, 0))
        );
        assert_eq!(
            derive_end_date(&Course::ForNWeeks { n: 2 }, start),
            Some(utc(2025, 2, 14, 9, 0))
        );
        assert_eq!(
            derive_end_date(&Course::ForNMonths { n: 1 }, start),
            Some(utc(2025, 2, 28, 9, 0))
        );
        let until = utc(2025, 6, 1, 0, 0);
        assert_eq!(
            derive_end_date(&Course::UntilDate { until }, start),
            Some(until)
        );
    }

    #[test]
    fn oversized_counts_do_not_overflow() {
        let start = utc(2025, 1, 1, 8, 0);
        assert_eq!(derive_end_date(&Course::ForNDays { n: u32::MAX }, start), None);
        assert_eq!(derive_end_date(&Course::ForNWeeks { n: u32::MAX }, start), None);

        let r = reminder(
            Frequency::EveryNHours { n: u32::MAX },
            Course::Continuous,
            start,
        );
        let schedule = compile(&r, start);
        assert_eq!(schedule.next_due_at, Some(start));
        assert_eq!(schedule.successor(0, start, start), None);
    }

    #[test]
    fn instants_stop_at_year_9999() {
        let start = utc(9999, 12, 31, 0, 0);
        let r = reminder(
            Frequency::NTimesDaily {
                times: vec![at(8, 0)],
            },
            Course::Continuous,
            start,
        );
        let instants: Vec<_> = compile(&r, start).instants(start).take(3).collect();
        assert_eq!(instants, vec![utc(9999, 12, 31, 8, 0)]);
    }

    #[test]
    fn rules_serialize_for_storage() {
        let rules = rules_for(
            &Frequency::SpecificWeekdays {
                days: vec![3, 1, 3],
                times: vec![at(9, 0)],
            },
            utc(2025, 1, 1, 0, 0),
        );
        let json = serde_json::to_string(&rules).unwrap();
        assert_eq!(
            json,
            r#"[{"rule":"daily","time":"09:00","weekdays":[1,3]}]"#
        );
        let back: Vec<Rule> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rules);
    }
}

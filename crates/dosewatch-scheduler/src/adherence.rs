use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dosewatch_core::{OwnerId, ReminderId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::{
    db::{get_opt_ts, get_ts, init_db, ts},
    error::{Result, SchedulerError},
    store::{row_to_record, ADHERENCE_COLUMNS},
    types::AdherenceRecord,
};

/// A fired dose that was never acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissedDose {
    pub record_id: String,
    pub reminder_id: ReminderId,
    pub medicine_name: String,
    pub scheduled_time: DateTime<Utc>,
    pub time_since_missed_ms: i64,
    pub time_since_missed_minutes: i64,
    pub time_since_last_taken_ms: Option<i64>,
    pub time_since_last_taken_minutes: Option<i64>,
}

/// Read-only view over adherence records.
///
/// Uses its own `Connection` so API reads never queue behind the
/// scheduler's claim transactions on the store's mutex.
pub struct AdherenceTracker {
    conn: Mutex<Connection>,
}

impl AdherenceTracker {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::new(conn)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Doses still `scheduled` whose time has passed, most recent first.
    pub fn missed_for_owner(&self, owner: &OwnerId, now: DateTime<Utc>) -> Result<Vec<MissedDose>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.reminder_id, a.scheduled_time, r.medicine_name, r.last_taken_at
             FROM adherence a LEFT JOIN reminders r ON r.id = a.reminder_id
             WHERE a.owner_id = ?1 AND a.status = 'scheduled' AND a.scheduled_time < ?2
             ORDER BY a.scheduled_time DESC",
        )?;
        let missed = stmt
            .query_map(params![owner.as_str(), ts(now)], |row| {
                let scheduled_time = get_ts(row, 2)?;
                let last_taken = get_opt_ts(row, 4)?;
                let since_missed = (now - scheduled_time).num_milliseconds();
                let since_taken = last_taken.map(|t| (now - t).num_milliseconds());
                Ok(MissedDose {
                    record_id: row.get(0)?,
                    reminder_id: ReminderId(row.get(1)?),
                    medicine_name: row
                        .get::<_, Option<String>>(3)?
                        .unwrap_or_else(|| "Unknown".to_string()),
                    scheduled_time,
                    time_since_missed_ms: since_missed,
                    time_since_missed_minutes: since_missed / 60_000,
                    time_since_last_taken_ms: since_taken,
                    time_since_last_taken_minutes: since_taken.map(|ms| ms / 60_000),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(missed)
    }

    /// All adherence records of one reminder, newest first.
    pub fn history(&self, owner: &OwnerId, reminder_id: &ReminderId) -> Result<Vec<AdherenceRecord>> {
        let conn = self.conn();
        let found: Option<String> = conn
            .query_row(
                "SELECT owner_id FROM reminders WHERE id = ?1",
                [reminder_id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if found.as_deref() != Some(owner.as_str()) {
            return Err(SchedulerError::NotFound {
                id: reminder_id.to_string(),
            });
        }

        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {ADHERENCE_COLUMNS} FROM adherence
             WHERE reminder_id = ?1 ORDER BY scheduled_time DESC"
        ))?;
        let records = stmt
            .query_map([reminder_id.as_str()], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, m, 0).unwrap()
    }

    fn seed(conn: &Connection, last_taken: Option<DateTime<Utc>>) {
        init_db(conn).unwrap();
        conn.execute(
            "INSERT INTO reminders
             (id, owner_id, medicine_name, dosage, frequency_kind, frequency, course, rules,
              start_date, status, last_taken_at, created_at, updated_at)
             VALUES ('r1', 'u1', 'Lisinopril', '10mg', 'N_TIMES_DAILY', '{}', '{}', '[]',
                     ?1, 'active', ?2, ?1, ?1)",
            params![ts(utc(0, 0)), last_taken.map(ts)],
        )
        .unwrap();
        for (id, trigger, at, status) in [
            ("a1", "t1", utc(8, 0), "scheduled"),
            ("a2", "t2", utc(9, 0), "taken"),
            ("a3", "t3", utc(11, 0), "scheduled"),
        ] {
            conn.execute(
                "INSERT INTO adherence
                 (id, trigger_id, reminder_id, owner_id, scheduled_time, status, created_at)
                 VALUES (?1, ?2, 'r1', 'u1', ?3, ?4, ?3)",
                params![id, trigger, ts(at), status],
            )
            .unwrap();
        }
    }

    #[test]
    fn missed_dose_reports_minutes_since_scheduled() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, None);
        let tracker = AdherenceTracker::new(conn).unwrap();

        let missed = tracker
            .missed_for_owner(&OwnerId::from("u1"), utc(10, 30))
            .unwrap();
        // a2 is taken and a3 is still in the future.
        assert_eq!(missed.len(), 1);
        let dose = &missed[0];
        assert_eq!(dose.record_id, "a1");
        assert_eq!(dose.medicine_name, "Lisinopril");
        assert_eq!(dose.time_since_missed_minutes, 150);
        assert_eq!(dose.time_since_missed_ms, 150 * 60_000);
        assert_eq!(dose.time_since_last_taken_ms, None);
    }

    #[test]
    fn missed_dose_includes_time_since_last_taken() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, Some(utc(9, 10)));
        let tracker = AdherenceTracker::new(conn).unwrap();

        let missed = tracker
            .missed_for_owner(&OwnerId::from("u1"), utc(10, 30))
            .unwrap();
        assert_eq!(missed[0].time_since_last_taken_minutes, Some(80));
    }

    #[test]
    fn missed_query_is_scoped_to_owner() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, None);
        let tracker = AdherenceTracker::new(conn).unwrap();
        let missed = tracker
            .missed_for_owner(&OwnerId::from("someone-else"), utc(23, 0))
            .unwrap();
        assert!(missed.is_empty());
    }

    #[test]
    fn history_is_newest_first_and_owner_checked() {
        let conn = Connection::open_in_memory().unwrap();
        seed(&conn, None);
        let tracker = AdherenceTracker::new(conn).unwrap();

        let ids: Vec<_> = tracker
            .history(&OwnerId::from("u1"), &ReminderId::from("r1"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["a3", "a2", "a1"]);

        let err = tracker
            .history(&OwnerId::from("u2"), &ReminderId::from("r1"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, Row};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`. Idempotent.
///
/// `reminders` holds each reminder with its JSON-encoded rule set;
/// `triggers` holds the next materialised instant of every live rule;
/// `adherence` holds one record per fired trigger.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reminders (
            id              TEXT    NOT NULL PRIMARY KEY,
            owner_id        TEXT    NOT NULL,
            medicine_name   TEXT    NOT NULL,
            dosage          TEXT    NOT NULL,
            frequency_kind  TEXT    NOT NULL,
            frequency       TEXT    NOT NULL,   -- JSON-encoded Frequency
            course          TEXT    NOT NULL,   -- JSON-encoded Course
            rules           TEXT    NOT NULL,   -- JSON-encoded Vec<Rule>
            start_date      TEXT    NOT NULL,
            end_date        TEXT,
            status          TEXT    NOT NULL DEFAULT 'active',
            next_due_at     TEXT,
            last_fired_at   TEXT,
            last_taken_at   TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_reminders_owner
            ON reminders (owner_id, next_due_at, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_reminders_next_due ON reminders (next_due_at);

        CREATE TABLE IF NOT EXISTS triggers (
            id              TEXT    NOT NULL PRIMARY KEY,
            reminder_id     TEXT    NOT NULL,
            rule_index      INTEGER NOT NULL,
            due_at          TEXT    NOT NULL,
            state           TEXT    NOT NULL DEFAULT 'pending',  -- pending|claimed|fired|discarded
            claimed_by      TEXT,
            claimed_at      TEXT,
            fired_at        TEXT,
            created_at      TEXT    NOT NULL
        ) STRICT;

        -- Claim query: WHERE state = 'pending' AND due_at <= ?
        CREATE INDEX IF NOT EXISTS idx_triggers_due ON triggers (state, due_at);
        CREATE INDEX IF NOT EXISTS idx_triggers_reminder ON triggers (reminder_id, state);

        CREATE TABLE IF NOT EXISTS adherence (
            id              TEXT    NOT NULL PRIMARY KEY,
            trigger_id      TEXT    NOT NULL UNIQUE,
            reminder_id     TEXT    NOT NULL,
            owner_id        TEXT    NOT NULL,
            scheduled_time  TEXT    NOT NULL,
            taken_time      TEXT,
            status          TEXT    NOT NULL DEFAULT 'scheduled',
            created_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_adherence_owner
            ON adherence (owner_id, status, scheduled_time);
        CREATE INDEX IF NOT EXISTS idx_adherence_reminder
            ON adherence (reminder_id, scheduled_time DESC);
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix), so string
/// comparison in SQL matches chronological order.
pub(crate) fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
    }
}

pub(crate) fn get_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

/// Parse a `Display`/`FromStr` enum column (status strings).
pub(crate) fn get_parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

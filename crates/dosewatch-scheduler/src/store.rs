use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use dosewatch_core::config::DEFAULT_CLAIM_LEASE_SECS;
use dosewatch_core::{OwnerId, ReminderId};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    db::{get_json, get_opt_ts, get_parsed, get_ts, init_db, opt_ts, ts},
    error::{Result, SchedulerError},
    schedule::{compile, derive_end_date, CompiledSchedule, Rule},
    types::{
        AdherenceRecord, AdherenceStatus, ClaimedTrigger, Page, Reminder, ReminderInput,
        ReminderStatus,
    },
    validate::{check_timestamp, validate},
};

const REMINDER_COLUMNS: &str = "id, owner_id, medicine_name, dosage, frequency, course,
    start_date, end_date, status, next_due_at, last_fired_at, last_taken_at,
    created_at, updated_at";

pub(crate) const ADHERENCE_COLUMNS: &str =
    "id, trigger_id, reminder_id, owner_id, scheduled_time, taken_time, status, created_at";

/// Map a SELECT row (column order from REMINDER_COLUMNS) to a Reminder.
fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        id: ReminderId(row.get(0)?),
        owner_id: OwnerId(row.get(1)?),
        medicine_name: row.get(2)?,
        dosage: row.get(3)?,
        frequency: get_json(row, 4)?,
        course: get_json(row, 5)?,
        start_date: get_ts(row, 6)?,
        end_date: get_opt_ts(row, 7)?,
        status: get_parsed(row, 8)?,
        next_due_at: get_opt_ts(row, 9)?,
        last_fired_at: get_opt_ts(row, 10)?,
        last_taken_at: get_opt_ts(row, 11)?,
        created_at: get_ts(row, 12)?,
        updated_at: get_ts(row, 13)?,
    })
}

/// Map a SELECT row (column order from ADHERENCE_COLUMNS) to an AdherenceRecord.
pub(crate) fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdherenceRecord> {
    Ok(AdherenceRecord {
        id: row.get(0)?,
        trigger_id: row.get(1)?,
        reminder_id: ReminderId(row.get(2)?),
        owner_id: OwnerId(row.get(3)?),
        scheduled_time: get_ts(row, 4)?,
        taken_time: get_opt_ts(row, 5)?,
        status: get_parsed(row, 6)?,
        created_at: get_ts(row, 7)?,
    })
}

/// Trigger row as returned by a claiming UPDATE … RETURNING.
struct RawClaim {
    trigger_id: String,
    reminder_id: ReminderId,
    rule_index: usize,
    due_at: DateTime<Utc>,
}

/// Durable home for reminders, their compiled schedules and pending trigger instants.
///
/// Every mutating operation runs in a `BEGIN IMMEDIATE` transaction, so the
/// SQLite write lock serialises it against other connections,
/// including other scheduler instances on the same database file.
pub struct ReminderStore {
    db: Mutex<Connection>,
    claim_lease: Duration,
}

impl ReminderStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            claim_lease: Duration::seconds(DEFAULT_CLAIM_LEASE_SECS as i64),
        })
    }

    /// Open (or create) the database at `path` with WAL and a busy timeout,
    /// so several instances can share the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::new(conn)
    }

    /// How long a claim may stay un-fired before another worker can take it over.
    pub fn with_claim_lease(mut self, secs: u64) -> Self {
        self.claim_lease = Duration::seconds(secs as i64);
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- reminder lifecycle --------------------------------------------------

    /// Validate, persist and schedule a new reminder.
    #[instrument(skip(self, input), fields(owner_id = %owner))]
    pub fn create(
        &self,
        owner: &OwnerId,
        input: ReminderInput,
        now: DateTime<Utc>,
    ) -> Result<Reminder> {
        let mut reminder = build_reminder(ReminderId::new(), owner.clone(), input, now, now, now)?;
        let schedule = self.put(&reminder, now)?;
        reminder.next_due_at = schedule.next_due_at;
        info!(
            reminder_id = %reminder.id,
            kind = reminder.frequency.kind(),
            end_date = ?reminder.end_date,
            next_due_at = ?reminder.next_due_at,
            "reminder created"
        );
        Ok(reminder)
    }

    /// Replace a reminder's definition. The reminder becomes active again and
    /// its schedule is rebuilt from scratch.
    #[instrument(skip(self, input), fields(owner_id = %owner, reminder_id = %id))]
    pub fn update(
        &self,
        owner: &OwnerId,
        id: &ReminderId,
        input: ReminderInput,
        now: DateTime<Utc>,
    ) -> Result<Reminder> {
        let existing = self.get_for_owner(owner, id)?;
        let mut reminder = build_reminder(
            existing.id,
            existing.owner_id,
            input,
            existing.start_date,
            existing.created_at,
            now,
        )?;
        reminder.last_fired_at = existing.last_fired_at;
        reminder.last_taken_at = existing.last_taken_at;
        let schedule = self.put(&reminder, now)?;
        reminder.next_due_at = schedule.next_due_at;
        info!(next_due_at = ?reminder.next_due_at, "reminder updated");
        Ok(reminder)
    }

    /// Recompile `reminder` and atomically replace its stored schedule.
    ///
    /// All not-yet-claimed instants of the previous schedule are retracted
    /// in the same transaction that writes the new ones. Claims already in
    /// flight are left alone; the runner's status re-check resolves them.
    #[instrument(skip(self, reminder), fields(reminder_id = %reminder.id))]
    pub fn put(&self, reminder: &Reminder, now: DateTime<Utc>) -> Result<CompiledSchedule> {
        let schedule = compile(reminder, now);
        let active = reminder.status == ReminderStatus::Active;
        let next_due = if active { schedule.next_due_at } else { None };

        let frequency_json = serde_json::to_string(&reminder.frequency)?;
        let course_json = serde_json::to_string(&reminder.course)?;
        let rules_json = serde_json::to_string(&schedule.rules)?;

        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let retracted = tx.execute(
            "DELETE FROM triggers WHERE reminder_id = ?1 AND state = 'pending'",
            [reminder.id.as_str()],
        )?;
        // owner_id, created_at and the runner-owned columns are never
        // overwritten on conflict.
        tx.execute(
            "INSERT INTO reminders
             (id, owner_id, medicine_name, dosage, frequency_kind, frequency, course, rules,
              start_date, end_date, status, next_due_at, last_fired_at, last_taken_at,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
             ON CONFLICT(id) DO UPDATE SET
                medicine_name  = excluded.medicine_name,
                dosage         = excluded.dosage,
                frequency_kind = excluded.frequency_kind,
                frequency      = excluded.frequency,
                course         = excluded.course,
                rules          = excluded.rules,
                start_date     = excluded.start_date,
                end_date       = excluded.end_date,
                status         = excluded.status,
                next_due_at    = excluded.next_due_at,
                updated_at     = excluded.updated_at",
            params![
                reminder.id.as_str(),
                reminder.owner_id.as_str(),
                reminder.medicine_name,
                reminder.dosage,
                reminder.frequency.kind(),
                frequency_json,
                course_json,
                rules_json,
                ts(reminder.start_date),
                opt_ts(reminder.end_date),
                reminder.status.to_string(),
                opt_ts(next_due),
                opt_ts(reminder.last_fired_at),
                opt_ts(reminder.last_taken_at),
                ts(reminder.created_at),
                ts(reminder.updated_at),
            ],
        )?;
        if active {
            // An instant already claimed or fired must not be materialised again.
            let fired_through = tx.query_row(
                "SELECT MAX(due_at) FROM triggers
                 WHERE reminder_id = ?1 AND state IN ('claimed', 'fired')",
                [reminder.id.as_str()],
                |r| get_opt_ts(r, 0),
            )?;
            for (rule_index, due_at) in schedule.pending(now) {
                let due_at = match fired_through {
                    Some(last) if due_at <= last => {
                        match schedule.successor(rule_index, last, now) {
                            Some(next) => next,
                            None => continue,
                        }
                    }
                    _ => due_at,
                };
                insert_trigger(&tx, &reminder.id, rule_index, due_at, now)?;
            }
        }
        tx.commit()?;

        debug!(retracted, rules = schedule.rules.len(), "schedule replaced");
        Ok(schedule)
    }

    /// Retract every pending instant and mark the reminder cancelled.
    ///
    /// Idempotent: returns `Ok(false)` when the reminder was already
    /// cancelled or completed.
    #[instrument(skip(self), fields(reminder_id = %id))]
    pub fn cancel(&self, id: &ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let exists = tx
            .query_row("SELECT 1 FROM reminders WHERE id = ?1", [id.as_str()], |_| {
                Ok(())
            })
            .optional()?;
        if exists.is_none() {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        let retracted = tx.execute(
            "DELETE FROM triggers WHERE reminder_id = ?1 AND state = 'pending'",
            [id.as_str()],
        )?;
        let changed = tx.execute(
            "UPDATE reminders SET status = 'cancelled', next_due_at = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'active'",
            params![id.as_str(), ts(now)],
        )?;
        tx.commit()?;
        if changed > 0 {
            info!(retracted, "reminder cancelled");
        }
        Ok(changed > 0)
    }

    /// Cancel and remove a reminder together with its triggers and adherence history.
    #[instrument(skip(self), fields(owner_id = %owner, reminder_id = %id))]
    pub fn delete(&self, owner: &OwnerId, id: &ReminderId) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let found: Option<String> = tx
            .query_row(
                "SELECT owner_id FROM reminders WHERE id = ?1",
                [id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        if found.as_deref() != Some(owner.as_str()) {
            return Err(SchedulerError::NotFound { id: id.to_string() });
        }
        let triggers = tx.execute("DELETE FROM triggers WHERE reminder_id = ?1", [id.as_str()])?;
        let records = tx.execute("DELETE FROM adherence WHERE reminder_id = ?1", [id.as_str()])?;
        tx.execute("DELETE FROM reminders WHERE id = ?1", [id.as_str()])?;
        tx.commit()?;
        info!(triggers, records, "reminder deleted");
        Ok(())
    }

    /// Mark an active reminder completed and retract anything still pending.
    pub fn complete(&self, id: &ReminderId, now: DateTime<Utc>) -> Result<bool> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = complete_in(&tx, id.as_str(), now)?;
        tx.commit()?;
        if changed {
            info!(reminder_id = %id, "reminder completed");
        }
        Ok(changed)
    }

    /// Complete every active reminder that can never fire again: recurring
    /// reminders whose end date has passed, and one-shot reminders with no
    /// live trigger left. Returns how many were completed.
    pub fn complete_exhausted(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT r.id FROM reminders r
                 WHERE r.status = 'active' AND (
                    (r.end_date IS NOT NULL AND r.end_date < ?1)
                    OR (r.frequency_kind = 'ONCE' AND NOT EXISTS (
                        SELECT 1 FROM triggers t
                        WHERE t.reminder_id = r.id AND t.state IN ('pending', 'claimed')))
                 )",
            )?;
            let rows = stmt
                .query_map([ts(now)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>();
            rows?
        };
        for id in &ids {
            complete_in(&tx, id, now)?;
        }
        tx.commit()?;
        if !ids.is_empty() {
            info!(count = ids.len(), "exhausted reminders completed");
        }
        Ok(ids.len())
    }

    // --- reads ---------------------------------------------------------------

    pub fn get(&self, id: &ReminderId) -> Result<Option<Reminder>> {
        let db = self.conn();
        let reminder = db
            .query_row(
                &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"),
                [id.as_str()],
                row_to_reminder,
            )
            .optional()?;
        Ok(reminder)
    }

    /// Fetch a reminder visible to `owner`. Someone else's reminder is `NotFound`.
    pub fn get_for_owner(&self, owner: &OwnerId, id: &ReminderId) -> Result<Reminder> {
        self.get(id)?
            .filter(|r| r.owner_id == *owner)
            .ok_or_else(|| SchedulerError::NotFound { id: id.to_string() })
    }

    /// Page through an owner's reminders, soonest next fire first (reminders
    /// with nothing pending last), then newest first.
    pub fn list_for_owner(&self, owner: &OwnerId, page: u32, limit: u32) -> Result<Page<Reminder>> {
        let page = page.max(1);
        let offset = (page as u64 - 1) * limit as u64;
        let db = self.conn();
        let total: u64 = db.query_row(
            "SELECT COUNT(*) FROM reminders WHERE owner_id = ?1",
            [owner.as_str()],
            |r| r.get(0),
        )?;
        let mut stmt = db.prepare(&format!(
            "SELECT {REMINDER_COLUMNS} FROM reminders WHERE owner_id = ?1
             ORDER BY next_due_at IS NULL, next_due_at ASC, created_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![owner.as_str(), limit, offset], row_to_reminder)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Page {
            items,
            total,
            page,
            limit,
        })
    }

    /// Materialised pending instants for one reminder, earliest first.
    pub fn pending_instants(&self, id: &ReminderId) -> Result<Vec<DateTime<Utc>>> {
        let db = self.conn();
        let mut stmt = db.prepare_cached(
            "SELECT due_at FROM triggers WHERE reminder_id = ?1 AND state = 'pending'
             ORDER BY due_at",
        )?;
        let instants = stmt
            .query_map([id.as_str()], |row| get_ts(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(instants)
    }

    /// Pending triggers already past due, i.e. the backlog a restarting scheduler picks up.
    pub fn count_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let db = self.conn();
        let n = db.query_row(
            "SELECT COUNT(*) FROM triggers WHERE state = 'pending' AND due_at < ?1",
            [ts(now)],
            |r| r.get(0),
        )?;
        Ok(n)
    }

    // --- claiming & firing -----------------------------------------------------

    /// Atomically claim every pending instant due at or before `now`.
    ///
    /// Find-and-mark is a single `UPDATE … RETURNING` inside an immediate
    /// transaction, so two callers (threads or processes) can never both
    /// receive the same instant. In the same transaction each freshly claimed
    /// rule is advanced to its successor instant, and claims whose lease
    /// expired without firing are taken over.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub fn claim_due(&self, now: DateTime<Utc>, worker_id: &str) -> Result<Vec<ClaimedTrigger>> {
        let now_s = ts(now);
        let stale_s = ts(now - self.claim_lease);

        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let recovered = claim_rows(
            &tx,
            "UPDATE triggers SET claimed_by = ?1, claimed_at = ?2
             WHERE state = 'claimed' AND claimed_at < ?3
             RETURNING id, reminder_id, rule_index, due_at",
            params![worker_id, now_s, stale_s],
        )?;
        let fresh = claim_rows(
            &tx,
            "UPDATE triggers SET state = 'claimed', claimed_by = ?1, claimed_at = ?2
             WHERE state = 'pending' AND due_at <= ?2
             RETURNING id, reminder_id, rule_index, due_at",
            params![worker_id, now_s],
        )?;

        let mut owners: HashMap<ReminderId, Option<(ReminderStatus, CompiledSchedule)>> =
            HashMap::new();
        for claim in recovered.iter().chain(fresh.iter()) {
            if !owners.contains_key(&claim.reminder_id) {
                let loaded = load_schedule(&tx, &claim.reminder_id)?;
                owners.insert(claim.reminder_id.clone(), loaded);
            }
        }

        // Recovered claims already advanced their rule when first claimed.
        let mut advanced = 0usize;
        for claim in &fresh {
            let Some(Some((ReminderStatus::Active, schedule))) = owners.get(&claim.reminder_id)
            else {
                continue;
            };
            if let Some(next) = schedule.successor(claim.rule_index, claim.due_at, now) {
                insert_trigger(&tx, &claim.reminder_id, claim.rule_index, next, now)?;
                advanced += 1;
            }
        }
        for id in owners.keys() {
            refresh_next_due(&tx, id)?;
        }
        tx.commit()?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "re-claimed triggers whose lease expired");
        }
        if !fresh.is_empty() {
            debug!(claimed = fresh.len(), advanced, "claimed due triggers");
        }

        let mut claims: Vec<ClaimedTrigger> = recovered
            .into_iter()
            .chain(fresh)
            .map(|raw| {
                let reminder_status = owners
                    .get(&raw.reminder_id)
                    .and_then(|o| o.as_ref().map(|(status, _)| *status));
                ClaimedTrigger {
                    trigger_id: raw.trigger_id,
                    reminder_id: raw.reminder_id,
                    rule_index: raw.rule_index,
                    due_at: raw.due_at,
                    claimed_by: worker_id.to_string(),
                    reminder_status,
                }
            })
            .collect();
        claims.sort_by_key(|c| c.due_at);
        Ok(claims)
    }

    /// Drop a claim without firing it (reminder gone or no longer active).
    pub fn discard(&self, claim: &ClaimedTrigger) -> Result<()> {
        let db = self.conn();
        db.execute(
            "UPDATE triggers SET state = 'discarded'
             WHERE id = ?1 AND claimed_by = ?2 AND state = 'claimed'",
            params![claim.trigger_id, claim.claimed_by],
        )?;
        Ok(())
    }

    /// Record the fire of a claimed instant: write its adherence record
    /// (scheduled at the fire time `now`), stamp `last_fired_at`, and
    /// complete one-shot reminders.
    ///
    /// Returns `Ok(None)` if the reminder stopped being active since the
    /// claim, and `ClaimConflict` if this worker no longer holds the claim.
    /// The record is keyed on the trigger, so a fire retried after a crash
    /// never produces a second record.
    #[instrument(skip(self, claim), fields(trigger_id = %claim.trigger_id, reminder_id = %claim.reminder_id))]
    pub fn record_fire(
        &self,
        claim: &ClaimedTrigger,
        now: DateTime<Utc>,
    ) -> Result<Option<AdherenceRecord>> {
        let now_s = ts(now);
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held = tx.execute(
            "UPDATE triggers SET state = 'fired', fired_at = ?1
             WHERE id = ?2 AND claimed_by = ?3 AND state = 'claimed'",
            params![now_s, claim.trigger_id, claim.claimed_by],
        )?;
        if held == 0 {
            return Err(SchedulerError::ClaimConflict {
                trigger_id: claim.trigger_id.clone(),
            });
        }

        let owner: Option<(String, ReminderStatus, String)> = tx
            .query_row(
                "SELECT owner_id, status, frequency_kind FROM reminders WHERE id = ?1",
                [claim.reminder_id.as_str()],
                |r| Ok((r.get(0)?, get_parsed(r, 1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((owner_id, _, kind)) =
            owner.filter(|(_, status, _)| *status == ReminderStatus::Active)
        else {
            tx.execute(
                "UPDATE triggers SET state = 'discarded' WHERE id = ?1",
                [claim.trigger_id.as_str()],
            )?;
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "INSERT INTO adherence
             (id, trigger_id, reminder_id, owner_id, scheduled_time, taken_time, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'scheduled', ?6)
             ON CONFLICT(trigger_id) DO NOTHING",
            params![
                Uuid::now_v7().to_string(),
                claim.trigger_id,
                claim.reminder_id.as_str(),
                owner_id,
                now_s,
                now_s,
            ],
        )?;
        let record = tx.query_row(
            &format!("SELECT {ADHERENCE_COLUMNS} FROM adherence WHERE trigger_id = ?1"),
            [claim.trigger_id.as_str()],
            row_to_record,
        )?;

        tx.execute(
            "UPDATE reminders SET last_fired_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now_s, claim.reminder_id.as_str()],
        )?;
        if kind == "ONCE" {
            complete_in(&tx, claim.reminder_id.as_str(), now)?;
        }
        tx.commit()?;
        Ok(Some(record))
    }

    // --- adherence transitions -----------------------------------------------

    /// `scheduled → taken`. `taken_at` may not precede the scheduled time.
    pub fn mark_taken(
        &self,
        owner: &OwnerId,
        record_id: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<AdherenceRecord> {
        check_timestamp("taken_at", taken_at)?;
        self.transition(owner, record_id, AdherenceStatus::Taken, Some(taken_at))
    }

    /// `scheduled → skipped`.
    pub fn mark_skipped(&self, owner: &OwnerId, record_id: &str) -> Result<AdherenceRecord> {
        self.transition(owner, record_id, AdherenceStatus::Skipped, None)
    }

    fn transition(
        &self,
        owner: &OwnerId,
        record_id: &str,
        to: AdherenceStatus,
        taken_at: Option<DateTime<Utc>>,
    ) -> Result<AdherenceRecord> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = tx
            .query_row(
                &format!("SELECT {ADHERENCE_COLUMNS} FROM adherence WHERE id = ?1"),
                [record_id],
                row_to_record,
            )
            .optional()?
            .filter(|r| r.owner_id == *owner)
            .ok_or_else(|| SchedulerError::NotFound {
                id: record_id.to_string(),
            })?;

        if record.status != AdherenceStatus::Scheduled {
            return Err(SchedulerError::InvalidTransition {
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(at) = taken_at {
            if at < record.scheduled_time {
                return Err(SchedulerError::InvalidSpec(
                    "taken time precedes scheduled time".to_string(),
                ));
            }
        }

        tx.execute(
            "UPDATE adherence SET status = ?1, taken_time = ?2 WHERE id = ?3",
            params![to.to_string(), opt_ts(taken_at), record_id],
        )?;
        if let Some(at) = taken_at {
            tx.execute(
                "UPDATE reminders SET last_taken_at = ?1
                 WHERE id = ?2 AND (last_taken_at IS NULL OR last_taken_at < ?1)",
                params![ts(at), record.reminder_id.as_str()],
            )?;
        }
        tx.commit()?;

        debug!(record_id, status = %to, "adherence record updated");
        Ok(AdherenceRecord {
            status: to,
            taken_time: taken_at,
            ..record
        })
    }
}

fn build_reminder(
    id: ReminderId,
    owner_id: OwnerId,
    input: ReminderInput,
    default_start: DateTime<Utc>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Reminder> {
    let start_date = input.start_date.unwrap_or(default_start).trunc_subsecs(0);
    validate(&input, start_date)?;
    let end_date = derive_end_date(&input.course, start_date);
    Ok(Reminder {
        id,
        owner_id,
        medicine_name: input.medicine_name.trim().to_string(),
        dosage: input.dosage.trim().to_string(),
        frequency: input.frequency,
        course: input.course,
        start_date,
        end_date,
        status: ReminderStatus::Active,
        next_due_at: None,
        last_fired_at: None,
        last_taken_at: None,
        created_at,
        updated_at: now,
    })
}

fn insert_trigger(
    conn: &Connection,
    reminder_id: &ReminderId,
    rule_index: usize,
    due_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO triggers (id, reminder_id, rule_index, due_at, state, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![
            Uuid::now_v7().to_string(),
            reminder_id.as_str(),
            rule_index as i64,
            ts(due_at),
            ts(now),
        ],
    )?;
    Ok(())
}

fn claim_rows(
    tx: &Transaction<'_>,
    sql: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<RawClaim>> {
    let mut stmt = tx.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(RawClaim {
                trigger_id: row.get(0)?,
                reminder_id: ReminderId(row.get(1)?),
                rule_index: row.get::<_, i64>(2)? as usize,
                due_at: get_ts(row, 3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>();
    rows
}

fn load_schedule(
    conn: &Connection,
    id: &ReminderId,
) -> Result<Option<(ReminderStatus, CompiledSchedule)>> {
    let row = conn
        .query_row(
            "SELECT status, rules, start_date, end_date FROM reminders WHERE id = ?1",
            [id.as_str()],
            |r| {
                Ok((
                    get_parsed::<ReminderStatus>(r, 0)?,
                    get_json::<Vec<Rule>>(r, 1)?,
                    get_ts(r, 2)?,
                    get_opt_ts(r, 3)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(status, rules, start, end)| {
        (
            status,
            CompiledSchedule::from_parts(id.clone(), rules, start, end),
        )
    }))
}

fn refresh_next_due(conn: &Connection, id: &ReminderId) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE reminders SET next_due_at = (
            SELECT MIN(due_at) FROM triggers WHERE reminder_id = ?1 AND state = 'pending')
         WHERE id = ?1",
        [id.as_str()],
    )?;
    Ok(())
}

fn complete_in(conn: &Connection, id: &str, now: DateTime<Utc>) -> rusqlite::Result<bool> {
    conn.execute(
        "DELETE FROM triggers WHERE reminder_id = ?1 AND state = 'pending'",
        [id],
    )?;
    let changed = conn.execute(
        "UPDATE reminders SET status = 'completed', next_due_at = NULL, updated_at = ?2
         WHERE id = ?1 AND status = 'active'",
        params![id, ts(now)],
    )?;
    Ok(changed > 0)
}

//! `dosewatch-scheduler`: the reminder scheduling engine.
//!
//! # Overview
//!
//! A [`ReminderInput`] is validated and compiled into a small rule set
//! ([`schedule::CompiledSchedule`]). The [`ReminderStore`] persists the
//! reminder in SQLite and materialises the next pending instant of every
//! rule in a `triggers` table. The [`SchedulerEngine`] ticks, atomically
//! claims due instants (advancing each rule to its successor in the same
//! transaction) and hands them to the [`ExecutionRunner`], which writes an
//! adherence record and notifies the owner through a [`Notifier`]. The
//! [`AdherenceTracker`] reads those records back as missed-dose analytics.
//!
//! # Frequencies
//!
//! | Kind                    | Rules                                          |
//! |-------------------------|------------------------------------------------|
//! | `ONCE`                  | one absolute instant                           |
//! | `N_TIMES_DAILY`         | one daily rule per `HH:MM`                     |
//! | `EVERY_N_HOURS`         | fixed interval anchored at `start_date`        |
//! | `EVERY_N_MINUTES`       | fixed interval anchored at `start_date`        |
//! | `SPECIFIC_WEEKDAYS`     | daily rule per time, filtered to weekdays      |
//! | `SPECIFIC_DAY_OF_MONTH` | monthly rule per time, clamped to month length |
//!
//! All wall-clock times are UTC.

pub mod adherence;
pub mod db;
pub mod engine;
pub mod error;
pub mod notify;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod types;
pub mod validate;

pub use adherence::{AdherenceTracker, MissedDose};
pub use engine::{SchedulerEngine, TickReport};
pub use error::{Result, SchedulerError};
pub use notify::{DeliveryAck, DeliveryError, LogNotifier, Notifier};
pub use runner::{ExecutionRunner, FireOutcome};
pub use store::ReminderStore;
pub use types::{
    AdherenceRecord, AdherenceStatus, ClaimedTrigger, Course, Frequency, Page, Reminder,
    ReminderInput, ReminderStatus, TimeOfDay,
};

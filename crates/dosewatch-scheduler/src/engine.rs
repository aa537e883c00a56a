use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dosewatch_core::config::SchedulerConfig;
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{Result, SchedulerError},
    runner::{ExecutionRunner, FireOutcome},
    store::ReminderStore,
    types::ReminderStatus,
};

/// Counters for one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub fired: usize,
    pub delivered: usize,
    pub discarded: usize,
    pub expired: usize,
    /// Reminders moved to `completed` at the end of the tick.
    pub completed: usize,
    pub failed: usize,
}

/// Drives the reminder schedule: claims due instants and hands them to the runner.
///
/// Any number of engines may share one database; the store's atomic claim
/// guarantees each instant is fired by exactly one of them.
pub struct SchedulerEngine {
    store: Arc<ReminderStore>,
    runner: Arc<ExecutionRunner>,
    worker_id: String,
    tick_every: Duration,
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<ReminderStore>,
        runner: Arc<ExecutionRunner>,
        config: &SchedulerConfig,
    ) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        Self {
            store,
            runner,
            worker_id,
            tick_every: Duration::from_secs(config.effective_tick_secs()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Main loop. Ticks until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            tick_secs = self.tick_every.as_secs(),
            "scheduler engine started"
        );
        self.report_overdue_on_startup();

        let mut interval = tokio::time::interval(self.tick_every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.claimed > 0 || report.completed > 0 => {
                            info!(
                                claimed = report.claimed,
                                fired = report.fired,
                                delivered = report.delivered,
                                discarded = report.discarded,
                                expired = report.expired,
                                completed = report.completed,
                                failed = report.failed,
                                "scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler tick error: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Claim everything due at `now` and fire it.
    ///
    /// Claims for reminders that are no longer active are dropped without
    /// firing. The rest fire concurrently. A claim whose fire fails stays
    /// claimed and is picked up again once its lease expires.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let claims = self.store.claim_due(now, &self.worker_id)?;
        let mut report = TickReport {
            claimed: claims.len(),
            ..TickReport::default()
        };

        let mut live = Vec::with_capacity(claims.len());
        for claim in claims {
            if claim.reminder_status == Some(ReminderStatus::Active) {
                live.push(claim);
            } else {
                self.store.discard(&claim)?;
                report.discarded += 1;
            }
        }

        let outcomes = join_all(live.iter().map(|claim| self.runner.fire(claim, now))).await;
        for (claim, outcome) in live.iter().zip(outcomes) {
            match outcome {
                Ok(FireOutcome::Fired { delivered, .. }) => {
                    report.fired += 1;
                    if delivered {
                        report.delivered += 1;
                    }
                }
                Ok(FireOutcome::Discarded) => report.discarded += 1,
                Ok(FireOutcome::Expired) => report.expired += 1,
                Err(SchedulerError::ClaimConflict { trigger_id }) => {
                    debug!(%trigger_id, "claim taken over by another worker");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(trigger_id = %claim.trigger_id, "fire failed: {e}");
                    report.failed += 1;
                }
            }
        }

        report.completed = self.store.complete_exhausted(now)?;
        Ok(report)
    }

    /// Nothing is marked missed here: overdue instants still fire on the first
    /// tick (collapsed to one per rule). This only surfaces the backlog.
    fn report_overdue_on_startup(&self) {
        match self.store.count_overdue(Utc::now()) {
            Ok(n) if n > 0 => warn!(count = n, "overdue reminder instants found on startup"),
            Err(e) => error!("overdue-on-startup query failed: {e}"),
            _ => {}
        }
    }
}

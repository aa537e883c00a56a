use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dosewatch_core::OwnerId;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    notify::{DeliveryError, Notifier},
    store::ReminderStore,
    types::{AdherenceRecord, ClaimedTrigger, ReminderStatus},
};

/// What happened to one claimed trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    /// Adherence record written; `delivered` reports the notification result.
    Fired {
        record: AdherenceRecord,
        delivered: bool,
    },
    /// The reminder was cancelled, completed or deleted after the claim.
    Discarded,
    /// The instant lies beyond the reminder's (possibly shortened) course.
    Expired,
}

/// Performs the side effects of a fired trigger.
pub struct ExecutionRunner {
    store: Arc<ReminderStore>,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
    delivery_failures: AtomicU64,
}

impl ExecutionRunner {
    pub fn new(store: Arc<ReminderStore>, notifier: Arc<dyn Notifier>, notify_timeout_ms: u64) -> Self {
        Self {
            store,
            notifier,
            notify_timeout: Duration::from_millis(notify_timeout_ms),
            delivery_failures: AtomicU64::new(0),
        }
    }

    /// Notifications that failed or timed out since startup.
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Fire one claimed trigger.
    ///
    /// The reminder is re-read first: a cancel or update that raced with the
    /// claim wins. The adherence record is committed before the notifier is
    /// called, and a delivery failure never undoes it.
    #[instrument(skip(self, claim, now), fields(trigger_id = %claim.trigger_id, reminder_id = %claim.reminder_id))]
    pub async fn fire(&self, claim: &ClaimedTrigger, now: DateTime<Utc>) -> Result<FireOutcome> {
        let reminder = match self.store.get(&claim.reminder_id)? {
            Some(r) if r.status == ReminderStatus::Active => r,
            _ => {
                self.store.discard(claim)?;
                return Ok(FireOutcome::Discarded);
            }
        };

        if let Some(end) = reminder.end_date {
            if claim.due_at >= end {
                self.store.discard(claim)?;
                if end < now {
                    self.store.complete(&reminder.id, now)?;
                }
                debug!(due_at = %claim.due_at, %end, "instant past end of course");
                return Ok(FireOutcome::Expired);
            }
        }

        let Some(record) = self.store.record_fire(claim, now)? else {
            return Ok(FireOutcome::Discarded);
        };
        info!(record_id = %record.id, scheduled_time = %record.scheduled_time, "dose due");

        let delivered = self.deliver(&reminder.owner_id, &reminder.message()).await;
        Ok(FireOutcome::Fired { record, delivered })
    }

    async fn deliver(&self, owner: &OwnerId, message: &str) -> bool {
        let ms = self.notify_timeout.as_millis() as u64;
        let result = tokio::time::timeout(self.notify_timeout, self.notifier.deliver(owner, message))
            .await
            .unwrap_or(Err(DeliveryError::Timeout { ms }));

        match result {
            Ok(ack) => {
                debug!(
                    notifier = self.notifier.name(),
                    reference = ?ack.reference,
                    "notification delivered"
                );
                true
            }
            Err(e) => {
                let total = self.delivery_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    notifier = self.notifier.name(),
                    owner_id = %owner,
                    failures = total,
                    "notification delivery failed: {e}"
                );
                false
            }
        }
    }
}

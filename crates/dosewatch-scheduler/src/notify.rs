use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dosewatch_core::OwnerId;
use tracing::info;

/// Delivery confirmation returned by a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAck {
    pub delivered_at: DateTime<Utc>,
    /// Transport-specific message id, when the transport issues one.
    pub reference: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("delivery rejected with status {status}")]
    Rejected { status: u16 },
}

/// Outbound channel for dose notifications (push, webhook, SMS gateway, …).
///
/// Delivery is best-effort: the adherence record for a fire is written
/// before `deliver` is called and stays whatever the outcome.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short lowercase identifier used in logs (e.g. `"webhook"`).
    fn name(&self) -> &str;

    async fn deliver(&self, owner: &OwnerId, message: &str) -> Result<DeliveryAck, DeliveryError>;
}

/// Notifier that only writes the notification to the log.
///
/// Used when no outbound transport is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, owner: &OwnerId, message: &str) -> Result<DeliveryAck, DeliveryError> {
        info!(owner_id = %owner, %message, "dose notification");
        Ok(DeliveryAck {
            delivered_at: Utc::now(),
            reference: None,
        })
    }
}

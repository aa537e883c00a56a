use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dosewatch_core::OwnerId;
use dosewatch_scheduler::{DeliveryAck, DeliveryError, Notifier};
use serde_json::json;

/// Delivers dose notifications by POSTing `{owner_id, message}` to a webhook.
///
/// The push/SMS fan-out behind the webhook is someone else's problem; any
/// 2xx counts as delivered.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, owner: &OwnerId, message: &str) -> Result<DeliveryAck, DeliveryError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "owner_id": owner, "message": message }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout {
                        ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
            });
        }

        let reference = resp
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(DeliveryAck {
            delivered_at: Utc::now(),
            reference,
        })
    }
}

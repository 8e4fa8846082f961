use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{error, warn};

use crate::infrastructure::broker_abstraction::{Delivery, MessageProperties, QueueSpec};
use crate::infrastructure::metrics::NotificationMetrics;
use crate::infrastructure::publisher::{PublishError, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Will fail the same way on every delivery.
    Permanent,
    /// Gave up after the delivery limit.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliveryDecision {
    Redeliver { after: Duration },
    DeadLetter(FailureKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Deliveries allowed before a transient failure is dead-lettered. 0 means unbounded.
    pub max_deliveries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl RedeliveryPolicy {
    pub fn decide(&self, delivery_count: u32, permanent: bool) -> RedeliveryDecision {
        if permanent {
            return RedeliveryDecision::DeadLetter(FailureKind::Permanent);
        }
        if self.max_deliveries > 0 && delivery_count >= self.max_deliveries {
            return RedeliveryDecision::DeadLetter(FailureKind::Exhausted);
        }
        RedeliveryDecision::Redeliver {
            after: self.backoff_for(delivery_count),
        }
    }

    /// `backoff_base * 2^(n-1)`, capped at `backoff_max`.
    pub fn backoff_for(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_queue: String,
    /// Original payload, base64 encoded since it may not be valid JSON.
    pub payload: String,
    pub reason: String,
    pub kind: FailureKind,
    pub delivery_count: u32,
    pub correlation_id: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_delivery(
        delivery: &Delivery,
        reason: impl Into<String>,
        kind: FailureKind,
    ) -> Self {
        Self {
            original_queue: delivery.queue.clone(),
            payload: STANDARD.encode(&delivery.payload),
            reason: reason.into(),
            kind,
            delivery_count: delivery.delivery_count,
            correlation_id: delivery.correlation_id(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn original_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.payload)
    }
}

/// Routes failed deliveries to `<queue>.dead_letter`.
pub struct DeadLetterQueue {
    publisher: Arc<Publisher>,
    metrics: Arc<NotificationMetrics>,
}

impl DeadLetterQueue {
    pub fn new(publisher: Arc<Publisher>, metrics: Arc<NotificationMetrics>) -> Self {
        Self { publisher, metrics }
    }

    pub async fn send_to_dlq(
        &self,
        delivery: &Delivery,
        reason: &str,
        kind: FailureKind,
    ) -> Result<(), PublishError> {
        let record = DeadLetterRecord::from_delivery(delivery, reason, kind);
        let payload = serde_json::to_vec(&record)?;
        let dlq = QueueSpec::durable(delivery.queue.as_str()).dead_letter();
        let properties = MessageProperties::persistent_json(record.correlation_id.clone())
            .with_header("x-failure-kind", kind.to_string());

        match self.publisher.publish_with(&dlq.name, &payload, &properties).await {
            Ok(()) => {
                NotificationMetrics::incr(&self.metrics.dlq_messages);
                warn!(
                    queue = %delivery.queue,
                    correlation_id = %record.correlation_id,
                    delivery_count = delivery.delivery_count,
                    kind = %kind,
                    "Dead-lettered message: {}",
                    reason
                );
                Ok(())
            }
            Err(e) => {
                NotificationMetrics::incr(&self.metrics.dlq_publish_failures);
                error!(
                    queue = %delivery.queue,
                    correlation_id = %record.correlation_id,
                    "Failed to dead-letter message: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

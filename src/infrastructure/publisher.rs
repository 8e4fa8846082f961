use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::events::{MalformedEventError, RegistrationEvent, USER_REGISTRATION_QUEUE};
use crate::infrastructure::broker_abstraction::{BrokerError, MessageProperties, QueueSpec};
use crate::infrastructure::broker_connection::BrokerConnection;
use crate::infrastructure::metrics::NotificationMetrics;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("refusing to publish malformed event: {0}")]
    InvalidEvent(#[from] MalformedEventError),
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to publish to queue '{queue}': {source}")]
    Broker {
        queue: String,
        #[source]
        source: BrokerError,
    },
}

/// Announces new accounts to downstream services.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationPublisher: Send + Sync {
    /// Returns the message id the event was published under.
    async fn publish_registration(&self, event: &RegistrationEvent) -> Result<String, PublishError>;
}

/// Enqueues persistent messages on durable queues. A failed publish is
/// reported once and never retried here.
pub struct Publisher {
    connection: Arc<BrokerConnection>,
    metrics: Arc<NotificationMetrics>,
    declared: DashSet<String>,
}

impl Publisher {
    pub fn new(connection: Arc<BrokerConnection>, metrics: Arc<NotificationMetrics>) -> Self {
        Self {
            connection,
            metrics,
            declared: DashSet::new(),
        }
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), PublishError> {
        if self.declared.contains(queue) {
            return Ok(());
        }
        self.connection
            .declare_queue(&QueueSpec::durable(queue))
            .await
            .map_err(|source| PublishError::Declare {
                queue: queue.to_string(),
                source,
            })?;
        self.declared.insert(queue.to_string());
        Ok(())
    }

    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.publish_with(queue, payload, &MessageProperties::default())
            .await
    }

    pub async fn publish_with(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), PublishError> {
        let start = Instant::now();
        let result = match self.ensure_declared(queue).await {
            Ok(()) => self
                .connection
                .publish(queue, payload, properties)
                .await
                .map_err(|source| {
                    if matches!(source, BrokerError::QueueNotFound(_)) {
                        self.declared.remove(queue);
                    }
                    PublishError::Broker {
                        queue: queue.to_string(),
                        source,
                    }
                }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                NotificationMetrics::incr(&self.metrics.messages_published);
                self.metrics.record_publish_latency(start.elapsed());
            }
            Err(e) => {
                NotificationMetrics::incr(&self.metrics.publish_errors);
                error!(queue = %queue, error = %e, "Publish failed");
            }
        }
        result
    }
}

#[async_trait]
impl RegistrationPublisher for Publisher {
    async fn publish_registration(
        &self,
        event: &RegistrationEvent,
    ) -> Result<String, PublishError> {
        event.ensure_valid()?;

        let message_id = Uuid::new_v4().to_string();
        let payload = event.clone().stamped(Utc::now()).to_payload()?;
        let properties = MessageProperties::persistent_json(message_id.clone());

        self.publish_with(USER_REGISTRATION_QUEUE, &payload, &properties)
            .await?;

        info!(
            queue = USER_REGISTRATION_QUEUE,
            correlation_id = %message_id,
            account_id = %event.account_id,
            "Published registration event"
        );
        Ok(message_id)
    }
}

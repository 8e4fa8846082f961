use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Broker-side queue declaration. Declaring the same spec twice is a no-op;
/// declaring an existing queue with a different durability is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
        }
    }

    pub fn dead_letter(&self) -> QueueSpec {
        QueueSpec {
            name: format!("{}.dead_letter", self.name),
            durable: self.durable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    /// Broker writes the message to stable storage before it is delivered.
    pub persistent: bool,
    pub content_type: Option<String>,
    /// Correlation id carried into every log line about this message.
    pub message_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: Vec<(String, String)>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            persistent: true,
            content_type: None,
            message_id: None,
            timestamp: None,
            headers: Vec::new(),
        }
    }
}

impl MessageProperties {
    pub fn persistent_json(message_id: impl Into<String>) -> Self {
        Self {
            persistent: true,
            content_type: Some("application/json".to_string()),
            message_id: Some(message_id.into()),
            timestamp: Some(Utc::now()),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Identifies a delivery for settlement on the channel that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryTag {
    Sequence(u64),
    Offset { partition: i32, offset: i64 },
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryTag::Sequence(tag) => write!(f, "#{}", tag),
            DeliveryTag::Offset { partition, offset } => write!(f, "{}@{}", partition, offset),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn correlation_id(&self) -> String {
        self.properties
            .message_id
            .clone()
            .unwrap_or_else(|| self.tag.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("channel is closed")]
    ChannelClosed,
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("queue '{queue}' precondition failed: {reason}")]
    PreconditionFailed { queue: String, reason: String },
    #[error("queue '{0}' has not been declared")]
    QueueNotFound(String),
    #[error("channel is not consuming any queue")]
    NotConsuming,
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(DeliveryTag),
    #[error("operation not supported by this transport: {0}")]
    Unsupported(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// The channel can no longer be used and the connection must be reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::ChannelClosed | BrokerError::Unreachable(_))
    }
}

/// The logical channel protocol shared by every transport.
///
/// Calls are not assumed safe for uncoordinated concurrent use;
/// `BrokerConnection` serializes them.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Starts consuming `queue` on this channel.
    async fn consume(&self, queue: &str) -> Result<(), BrokerError>;

    /// Waits up to `wait` for the next delivery of the consumed queue.
    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Negative acknowledgement. With `requeue` the broker redelivers the message.
    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Upper bound on unsettled deliveries this transport can settle
    /// independently. `None` means unbounded.
    fn max_unsettled(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_queue_keeps_durability() {
        let spec = QueueSpec::durable("user_registration");
        assert_eq!(
            spec.dead_letter(),
            QueueSpec::durable("user_registration.dead_letter")
        );
    }

    #[test]
    fn test_correlation_id_falls_back_to_tag() {
        let delivery = Delivery {
            queue: "q".to_string(),
            tag: DeliveryTag::Offset {
                partition: 0,
                offset: 42,
            },
            payload: vec![],
            properties: MessageProperties::default(),
            delivery_count: 1,
        };
        assert_eq!(delivery.correlation_id(), "0@42");
        assert!(!delivery.redelivered());
    }

    #[test]
    fn test_header_lookup() {
        let props = MessageProperties::persistent_json("m-1").with_header("x-reason", "bad");
        assert_eq!(props.header("x-reason"), Some("bad"));
        assert_eq!(props.header("missing"), None);
        assert!(props.persistent);
    }
}

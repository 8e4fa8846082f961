//! Kafka transport for [`BrokerChannel`].
//!
//! Queue semantics map onto a single-partition topic consumed by one
//! consumer group: declaring a queue creates the topic, ack commits the
//! offset past the delivery, and requeue seeks the partition back to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::{
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::{ClientContext, DefaultClientContext},
    config::ClientConfig,
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::{KafkaResult, RDKafkaErrorCode},
    message::{Header, Headers, OwnedHeaders, OwnedMessage},
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::infrastructure::broker_abstraction::{
    BrokerChannel, BrokerError, Delivery, DeliveryTag, MessageProperties, QueueSpec,
};

const PERSISTENT_HEADER: &str = "x-persistent";
const CONTENT_TYPE_HEADER: &str = "content-type";
const MESSAGE_ID_HEADER: &str = "message-id";
const TIMESTAMP_HEADER: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub client_id: String,
    pub producer_acks: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
    pub request_timeout: Duration,
    pub replication_factor: i32,
    pub security_protocol: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "notification-service".to_string(),
            client_id: "sangeet-events".to_string(),
            producer_acks: "all".to_string(),
            // Messages published before the first subscriber joins must still be delivered.
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10000,
            request_timeout: Duration::from_secs(5),
            replication_factor: 1,
            security_protocol: "PLAINTEXT".to_string(),
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

impl KafkaConfig {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", &self.security_protocol)
            .set(
                "socket.timeout.ms",
                self.request_timeout.as_millis().to_string(),
            );
        if let Some(mechanism) = &self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.sasl_password {
            config.set("sasl.password", password);
        }
        config
    }
}

struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Pre-rebalance: {:?}", rebalance);
    }

    fn post_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Post-rebalance: {:?}", rebalance);
    }
}

type LoggingConsumer = StreamConsumer<LoggingConsumerContext>;

/// Runs a blocking librdkafka call on the blocking pool instead of an async worker.
async fn blocking<T, F>(call: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> KafkaResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
        .map_err(BrokerError::from)
}

pub struct KafkaChannel {
    producer: FutureProducer,
    consumer: Arc<LoggingConsumer>,
    admin: AdminClient<DefaultClientContext>,
    config: KafkaConfig,
    consuming: RwLock<Option<String>>,
    // Kafka keeps no redelivery counter, so it is tracked per (partition, offset).
    attempts: Mutex<HashMap<(i32, i64), u32>>,
    closed: AtomicBool,
}

impl KafkaChannel {
    /// Creates the clients and verifies the cluster answers a metadata
    /// request within `request_timeout`.
    pub async fn connect(config: KafkaConfig) -> Result<Self, BrokerError> {
        info!(
            "KafkaChannel: connecting - bootstrap_servers: {}, group_id: {}",
            config.bootstrap_servers, config.group_id
        );

        // Idempotent production keeps per-partition order across retries but requires acks=all.
        let idempotent = config.producer_acks == "all" || config.producer_acks == "-1";
        let producer: FutureProducer = config
            .client_config()
            .set("acks", &config.producer_acks)
            .set("enable.idempotence", idempotent.to_string())
            .set(
                "message.timeout.ms",
                config.request_timeout.as_millis().to_string(),
            )
            .create()?;

        let consumer: LoggingConsumer = config
            .client_config()
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("allow.auto.create.topics", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create_with_context(LoggingConsumerContext)?;

        let admin: AdminClient<DefaultClientContext> = config.client_config().create()?;

        let probe = producer.clone();
        let timeout = config.request_timeout;
        let brokers = tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::Transport(e.to_string()))?
        .map_err(|e| BrokerError::Unreachable(e.to_string()))?;

        info!("KafkaChannel: ✅ connected to {} broker(s)", brokers);
        Ok(Self {
            producer,
            consumer: Arc::new(consumer),
            admin,
            config,
            consuming: RwLock::new(None),
            attempts: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    fn record_attempt(&self, partition: i32, offset: i64) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = attempts.entry((partition, offset)).or_insert(0);
        *count += 1;
        *count
    }

    fn forget_attempts(&self, partition: i32, offset: i64) {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(partition, offset));
    }

    async fn commit_past(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let DeliveryTag::Offset { partition, offset } = delivery.tag else {
            return Err(BrokerError::UnknownDelivery(delivery.tag));
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&delivery.queue, partition, Offset::Offset(offset + 1))?;
        let consumer = self.consumer.clone();
        blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await?;
        self.forget_attempts(partition, offset);
        debug!(
            "KafkaChannel: committed {}:{} past offset {}",
            delivery.queue, partition, offset
        );
        Ok(())
    }

    fn to_delivery(&self, message: OwnedMessage) -> Delivery {
        let mut properties = MessageProperties::default();
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                let value = header
                    .value
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                match header.key {
                    PERSISTENT_HEADER => properties.persistent = value != "false",
                    CONTENT_TYPE_HEADER => properties.content_type = Some(value),
                    MESSAGE_ID_HEADER => properties.message_id = Some(value),
                    TIMESTAMP_HEADER => {
                        properties.timestamp = DateTime::parse_from_rfc3339(&value)
                            .ok()
                            .map(|t| t.with_timezone(&Utc))
                    }
                    key => properties.headers.push((key.to_string(), value)),
                }
            }
        }

        let partition = message.partition();
        let offset = message.offset();
        Delivery {
            queue: message.topic().to_string(),
            tag: DeliveryTag::Offset { partition, offset },
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            properties,
            delivery_count: self.record_attempt(partition, offset),
        }
    }
}

#[async_trait]
impl BrokerChannel for KafkaChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !spec.durable {
            return Err(BrokerError::Unsupported(format!(
                "kafka topics are always persisted; cannot declare '{}' as non-durable",
                spec.name
            )));
        }

        // One partition keeps a single publisher's messages in order.
        let topic = NewTopic::new(
            &spec.name,
            1,
            TopicReplication::Fixed(self.config.replication_factor),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.config.request_timeout));

        for result in self.admin.create_topics(&[topic], &options).await? {
            match result {
                Ok(name) => info!("KafkaChannel: created topic '{}'", name),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("KafkaChannel: topic '{}' already exists", name)
                }
                Err((name, code)) => {
                    return Err(BrokerError::Transport(format!(
                        "failed to create topic '{}': {}",
                        name, code
                    )))
                }
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let persistent = properties.persistent.to_string();
        let timestamp = properties.timestamp.map(|t| t.to_rfc3339());
        let mut headers = OwnedHeaders::new().insert(Header {
            key: PERSISTENT_HEADER,
            value: Some(persistent.as_str()),
        });
        if let Some(content_type) = &properties.content_type {
            headers = headers.insert(Header {
                key: CONTENT_TYPE_HEADER,
                value: Some(content_type.as_str()),
            });
        }
        if let Some(message_id) = &properties.message_id {
            headers = headers.insert(Header {
                key: MESSAGE_ID_HEADER,
                value: Some(message_id.as_str()),
            });
        }
        if let Some(timestamp) = &timestamp {
            headers = headers.insert(Header {
                key: TIMESTAMP_HEADER,
                value: Some(timestamp.as_str()),
            });
        }
        for (key, value) in &properties.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let key = properties.message_id.as_deref().unwrap_or(queue);
        let record = FutureRecord::to(queue)
            .payload(payload)
            .key(key)
            .headers(headers);

        // The delivery report resolves once the configured acks are met.
        self.producer
            .send(record, Timeout::After(self.config.request_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| BrokerError::Kafka(e))
    }

    async fn consume(&self, queue: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.consumer.subscribe(&[queue])?;
        *self.consuming.write().await = Some(queue.to_string());
        info!("KafkaChannel: subscribed to '{}'", queue);
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_open()?;
        if self.consuming.read().await.is_none() {
            return Err(BrokerError::NotConsuming);
        }

        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(message)) => Ok(Some(self.to_delivery(message.detach()))),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.commit_past(delivery).await
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if !requeue {
            warn!(
                "KafkaChannel: discarding {} on '{}'",
                delivery.tag, delivery.queue
            );
            return self.commit_past(delivery).await;
        }

        let DeliveryTag::Offset { partition, offset } = delivery.tag else {
            return Err(BrokerError::UnknownDelivery(delivery.tag));
        };
        let consumer = self.consumer.clone();
        let topic = delivery.queue.clone();
        let timeout = self.config.request_timeout;
        blocking(move || consumer.seek(&topic, partition, Offset::Offset(offset), timeout)).await?;
        debug!(
            "KafkaChannel: rewound {}:{} to offset {}",
            delivery.queue, partition, offset
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.consumer.unsubscribe();
        let producer = self.producer.clone();
        let timeout = self.config.request_timeout;
        blocking(move || producer.flush(timeout)).await?;
        info!("KafkaChannel: closed");
        Ok(())
    }

    /// Offsets can only be committed in order.
    fn max_unsettled(&self) -> Option<usize> {
        Some(1)
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use url::Url;

use crate::infrastructure::broker_abstraction::{
    BrokerChannel, BrokerError, Delivery, MessageProperties, QueueSpec,
};
use crate::infrastructure::in_memory_broker::InMemoryBroker;
use crate::infrastructure::kafka_abstraction::{KafkaChannel, KafkaConfig};

const DEFAULT_KAFKA_PORT: u16 = 9092;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed broker URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("unsupported broker scheme '{0}' (expected kafka:// or memory://)")]
    UnsupportedScheme(String),
    #[error("broker at {endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: BrokerError,
    },
    #[error("timed out after {after:?} connecting to broker at {endpoint}")]
    Timeout { endpoint: String, after: Duration },
}

/// Transport settings that are not part of the URI.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub connect_timeout: Duration,
    pub group_id: String,
    pub client_id: String,
    pub producer_acks: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            group_id: "notification-service".to_string(),
            client_id: "sangeet-events".to_string(),
            producer_acks: "all".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Kafka(KafkaConfig),
    Memory(String),
}

impl BrokerEndpoint {
    /// Parses `kafka://[user:pass@]host:port[,host:port...][?group=..&tls=true]`
    /// or `memory://<name>`.
    pub fn parse(uri: &str, settings: &BrokerSettings) -> Result<Self, ConnectionError> {
        let invalid = |reason: &str| ConnectionError::InvalidUri {
            uri: redact(uri),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "memory" => {
                let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;
                let name = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .unwrap_or("default");
                Ok(BrokerEndpoint::Memory(name.to_string()))
            }
            "kafka" => {
                // `url` cannot parse a host list, so extra hosts are split off first.
                let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
                let (authority, tail) = rest.split_at(authority_end);
                let (userinfo, hosts) = match authority.rsplit_once('@') {
                    Some((userinfo, hosts)) => (Some(userinfo), hosts),
                    None => (None, authority),
                };
                let mut hosts = hosts.split(',');
                let first = hosts.next().filter(|h| !h.is_empty());
                let first = first.ok_or_else(|| invalid("missing host"))?;
                let userinfo = userinfo.map(|u| format!("{}@", u)).unwrap_or_default();

                let url = Url::parse(&format!("kafka://{}{}{}", userinfo, first, tail))
                    .map_err(|e| invalid(&e.to_string()))?;
                let host = url.host_str().ok_or_else(|| invalid("missing host"))?;

                let mut servers = vec![format!(
                    "{}:{}",
                    host,
                    url.port().unwrap_or(DEFAULT_KAFKA_PORT)
                )];
                for extra in hosts {
                    let parsed = Url::parse(&format!("kafka://{}", extra))
                        .map_err(|e| invalid(&e.to_string()))?;
                    let extra_host = parsed
                        .host_str()
                        .ok_or_else(|| invalid("missing host in host list"))?;
                    servers.push(format!(
                        "{}:{}",
                        extra_host,
                        parsed.port().unwrap_or(DEFAULT_KAFKA_PORT)
                    ));
                }

                let mut config = KafkaConfig {
                    bootstrap_servers: servers.join(","),
                    group_id: settings.group_id.clone(),
                    client_id: settings.client_id.clone(),
                    producer_acks: settings.producer_acks.clone(),
                    request_timeout: settings.connect_timeout,
                    ..Default::default()
                };

                let mut tls = false;
                for (key, value) in url.query_pairs() {
                    match key.as_ref() {
                        "group" => config.group_id = value.into_owned(),
                        "tls" => tls = value == "true",
                        other => warn!("Ignoring unknown broker URI parameter '{}'", other),
                    }
                }

                if !url.username().is_empty() {
                    config.sasl_mechanism = Some("PLAIN".to_string());
                    config.sasl_username = Some(url.username().to_string());
                    config.sasl_password = url.password().map(str::to_string);
                    config.security_protocol = if tls { "SASL_SSL" } else { "SASL_PLAINTEXT" }
                        .to_string();
                } else if tls {
                    config.security_protocol = "SSL".to_string();
                }

                Ok(BrokerEndpoint::Kafka(config))
            }
            other => Err(ConnectionError::UnsupportedScheme(other.to_string())),
        }
    }

    /// Loggable description with credentials left out.
    pub fn describe(&self) -> String {
        match self {
            BrokerEndpoint::Kafka(config) => format!("kafka://{}", config.bootstrap_servers),
            BrokerEndpoint::Memory(name) => format!("memory://{}", name),
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        match self {
            BrokerEndpoint::Kafka(config) => {
                let channel = KafkaChannel::connect(config.clone()).await?;
                Ok(Arc::new(channel))
            }
            BrokerEndpoint::Memory(name) => {
                Ok(Arc::new(InMemoryBroker::named(name).open_channel()))
            }
        }
    }
}

fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(start), Some(at)) if at > start => {
            format!("{}://***{}", &uri[..start], &uri[at..])
        }
        _ => uri.to_string(),
    }
}

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<dyn BrokerChannel>>,
}

/// One connection and one logical channel, shared by every publish and
/// subscribe operation in the process. Channel calls are serialized through
/// a single async mutex.
pub struct BrokerConnection {
    endpoint: Option<BrokerEndpoint>,
    connect_timeout: Duration,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl BrokerConnection {
    /// Opens the connection eagerly; failures are meant to be fatal at startup.
    pub async fn connect(uri: &str) -> Result<Self, ConnectionError> {
        Self::connect_with(uri, &BrokerSettings::default()).await
    }

    pub async fn connect_with(
        uri: &str,
        settings: &BrokerSettings,
    ) -> Result<Self, ConnectionError> {
        let endpoint = BrokerEndpoint::parse(uri, settings)?;
        let connection = Self::lazy(endpoint, settings.connect_timeout);
        connection.open().await?;
        Ok(connection)
    }

    /// A connection that is opened on first use.
    pub fn lazy(endpoint: BrokerEndpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint: Some(endpoint),
            connect_timeout,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                channel: None,
            }),
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    /// Wraps an already open channel. Such a connection cannot be reopened.
    pub fn from_channel(channel: Arc<dyn BrokerChannel>) -> Self {
        Self {
            endpoint: None,
            connect_timeout: Duration::ZERO,
            inner: Mutex::new(Inner {
                state: ConnectionState::Connected,
                channel: Some(channel),
            }),
            state_tx: watch::Sender::new(ConnectionState::Connected),
        }
    }

    pub fn describe(&self) -> String {
        self.endpoint
            .as_ref()
            .map(BrokerEndpoint::describe)
            .unwrap_or_else(|| "injected channel".to_string())
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Resolves once the connection is `Failed`, immediately if it already is.
    /// A failed connection stays unusable until `open` is called again.
    pub async fn failed(&self) {
        let mut states = self.state_tx.subscribe();
        // The sender lives as long as `self`, so this cannot see a closed channel.
        let _ = states.wait_for(|state| *state == ConnectionState::Failed).await;
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Opens the channel if it is not open. Also the explicit way back from `Failed`.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Connected {
            return Ok(());
        }
        self.establish(&mut inner).await.map(|_| ())
    }

    async fn establish(
        &self,
        inner: &mut Inner,
    ) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let endpoint = self.endpoint.as_ref().ok_or_else(|| ConnectionError::Unreachable {
            endpoint: self.describe(),
            source: BrokerError::ChannelClosed,
        })?;
        let description = endpoint.describe();

        self.set_state(inner, ConnectionState::Connecting);
        info!("Connecting to broker at {}", description);

        let opened = tokio::time::timeout(self.connect_timeout, endpoint.open_channel()).await;
        let result = match opened {
            Err(_) => Err(ConnectionError::Timeout {
                endpoint: description.clone(),
                after: self.connect_timeout,
            }),
            Ok(Err(source)) => Err(ConnectionError::Unreachable {
                endpoint: description.clone(),
                source,
            }),
            Ok(Ok(channel)) => Ok(channel),
        };

        match result {
            Ok(channel) => {
                self.set_state(inner, ConnectionState::Connected);
                inner.channel = Some(channel.clone());
                info!("Connected to broker at {}", description);
                Ok(channel)
            }
            Err(e) => {
                self.set_state(inner, ConnectionState::Failed);
                inner.channel = None;
                error!("Failed to connect to broker: {}", e);
                Err(e)
            }
        }
    }

    async fn with_channel<T, F, Fut>(&self, op: F) -> Result<T, BrokerError>
    where
        F: FnOnce(Arc<dyn BrokerChannel>) -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut inner = self.inner.lock().await;
        let channel = match (inner.state, inner.channel.clone()) {
            (ConnectionState::Connected, Some(channel)) => channel,
            (ConnectionState::Disconnected, _) => self
                .establish(&mut inner)
                .await
                .map_err(|e| BrokerError::Unreachable(e.to_string()))?,
            _ => return Err(BrokerError::ChannelClosed),
        };

        let result = op(channel).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Broker channel failed, connection marked failed: {}", e);
                self.set_state(&mut inner, ConnectionState::Failed);
                inner.channel = None;
            }
        }
        result
    }

    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.with_channel(|channel| async move { channel.declare_queue(spec).await })
            .await
    }

    pub async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.with_channel(|channel| async move {
            channel.publish(queue, payload, properties).await
        })
        .await
    }

    pub async fn consume(&self, queue: &str) -> Result<(), BrokerError> {
        self.with_channel(|channel| async move { channel.consume(queue).await })
            .await
    }

    /// Keep `wait` short: the connection is locked for its duration.
    pub async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.with_channel(|channel| async move { channel.next_delivery(wait).await })
            .await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.with_channel(|channel| async move { channel.ack(delivery).await })
            .await
    }

    pub async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.with_channel(|channel| async move { channel.reject(delivery, requeue).await })
            .await
    }

    pub async fn max_unsettled(&self) -> Result<Option<usize>, BrokerError> {
        self.with_channel(|channel| async move { Ok(channel.max_unsettled()) })
            .await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        let channel = inner.channel.take();
        self.set_state(&mut inner, ConnectionState::Disconnected);
        match channel {
            Some(channel) => {
                info!("Closing broker connection to {}", self.describe());
                channel.close().await
            }
            None => Ok(()),
        }
    }
}

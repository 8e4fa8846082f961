#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

use sangeet_events::application::NotificationHandler;
use sangeet_events::domain::{FullName, RegistrationEvent, Role};
use sangeet_events::infrastructure::logging::init_test_logging;
use sangeet_events::infrastructure::{
    BrokerConnection, DeadLetterQueue, DeliveryError, EmailDispatcher, InMemoryBroker,
    NotificationMetrics, Publisher, RedeliveryPolicy, Subscriber, SubscriberConfig,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records every send; can fail the first N attempts or hold sends until released.
pub struct RecordingDispatcher {
    sent: Mutex<Vec<SentEmail>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    failure: DeliveryError,
    gate: Option<Semaphore>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::failing(0, DeliveryError::Transport("unused".to_string()))
    }

    pub fn failing(times: usize, failure: DeliveryError) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(times),
            failure,
            gate: None,
        }
    }

    pub fn always_failing(failure: DeliveryError) -> Self {
        Self::failing(usize::MAX, failure)
    }

    /// Every send blocks until `release` lets it through.
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new()
        }
    }

    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailDispatcher for RecordingDispatcher {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.failure.clone());
        }

        self.sent.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn verify(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

pub struct Pipeline {
    pub name: String,
    pub broker: InMemoryBroker,
    pub connection: Arc<BrokerConnection>,
    pub publisher: Arc<Publisher>,
    pub subscriber: Subscriber,
    pub metrics: Arc<NotificationMetrics>,
}

pub fn unique_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

pub fn fast_config(max_deliveries: u32) -> SubscriberConfig {
    SubscriberConfig {
        workers: 1,
        policy: RedeliveryPolicy {
            max_deliveries,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(10),
        },
        poll_interval: Duration::from_millis(10),
    }
}

/// Connects a fresh publisher/subscriber pair to the in-memory broker `name`.
pub async fn pipeline_on(name: &str, config: SubscriberConfig) -> Pipeline {
    init_test_logging();
    let connection = Arc::new(
        BrokerConnection::connect(&format!("memory://{}", name))
            .await
            .unwrap(),
    );
    let metrics = Arc::new(NotificationMetrics::default());
    let publisher = Arc::new(Publisher::new(connection.clone(), metrics.clone()));
    let dead_letters = Arc::new(DeadLetterQueue::new(publisher.clone(), metrics.clone()));
    let subscriber = Subscriber::new(connection.clone(), dead_letters, metrics.clone(), config);

    Pipeline {
        name: name.to_string(),
        broker: InMemoryBroker::named(name),
        connection,
        publisher,
        subscriber,
        metrics,
    }
}

pub async fn pipeline(prefix: &str, config: SubscriberConfig) -> Pipeline {
    pipeline_on(&unique_name(prefix), config).await
}

pub fn notification_handler(
    dispatcher: Arc<RecordingDispatcher>,
    metrics: Arc<NotificationMetrics>,
) -> Arc<NotificationHandler> {
    Arc::new(NotificationHandler::new(dispatcher, metrics, "Sangeet"))
}

pub fn ann() -> RegistrationEvent {
    RegistrationEvent::new("acc-ann", "a@b.com", FullName::new("Ann", "Lee"), Role::Artist)
}

pub fn listener(n: usize) -> RegistrationEvent {
    RegistrationEvent::new(
        format!("acc-{}", n),
        format!("user{}@example.com", n),
        FullName::new(format!("User{}", n), "Test"),
        Role::Listener,
    )
}

/// Polls `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

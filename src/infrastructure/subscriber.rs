//! Queue consumption with acknowledgement strictly after the handler's side
//! effects complete.
//!
//! A receiver task pulls deliveries from the shared connection and hands them
//! to a fixed pool of workers over a bounded channel. Each unsettled delivery
//! holds one semaphore permit, so prefetch never exceeds the pool size.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::infrastructure::broker_abstraction::{BrokerError, Delivery, QueueSpec};
use crate::infrastructure::broker_connection::BrokerConnection;
use crate::infrastructure::dead_letter::{DeadLetterQueue, RedeliveryDecision, RedeliveryPolicy};
use crate::infrastructure::metrics::NotificationMetrics;

/// Classifies a handler failure for the redelivery policy.
pub trait HandlerFailure: std::fmt::Display + Send + Sync {
    /// Redelivering would fail the same way.
    fn is_permanent(&self) -> bool;
}

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Error: HandlerFailure;

    async fn handle(&self, delivery: &Delivery) -> Result<(), Self::Error>;
}

/// Per-message lifecycle: `Delivered -> Processing -> {Acknowledged | Redelivered | DeadLettered}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeliveryState {
    Delivered,
    Processing,
    Acknowledged,
    Redelivered,
    DeadLettered,
    /// Settlement failed; the broker will redeliver once the channel is gone.
    Unsettled,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("failed to declare queue '{queue}': {source}")]
    Declare {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to consume queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("subscription to '{queue}' lost: {source}")]
    Lost {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("subscription task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Worker pool size, which is also the prefetch limit.
    pub workers: usize,
    pub policy: RedeliveryPolicy,
    /// Longest single wait on the shared connection.
    pub poll_interval: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            policy: RedeliveryPolicy::default(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct SubscriptionHandle {
    queue: String,
    workers: usize,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), SubscribeError>>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops receiving, lets in-flight messages settle, then returns.
    pub async fn shutdown(self) -> Result<(), SubscribeError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the subscription to end on its own.
    pub async fn join(self) -> Result<(), SubscribeError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SubscribeError::Panicked(e.to_string())),
        }
    }
}

pub struct Subscriber {
    connection: Arc<BrokerConnection>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<NotificationMetrics>,
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(
        connection: Arc<BrokerConnection>,
        dead_letters: Arc<DeadLetterQueue>,
        metrics: Arc<NotificationMetrics>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            connection,
            dead_letters,
            metrics,
            config,
        }
    }

    /// Declares `queue` and its dead-letter queue, then starts consuming.
    pub async fn subscribe<H: MessageHandler>(
        &self,
        queue: &str,
        handler: Arc<H>,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let spec = QueueSpec::durable(queue);
        for declared in [&spec, &spec.dead_letter()] {
            self.connection
                .declare_queue(declared)
                .await
                .map_err(|source| SubscribeError::Declare {
                    queue: declared.name.clone(),
                    source,
                })?;
        }

        let consume_error = |source| SubscribeError::Consume {
            queue: queue.to_string(),
            source,
        };
        self.connection.consume(queue).await.map_err(consume_error)?;
        let cap = self
            .connection
            .max_unsettled()
            .await
            .map_err(consume_error)?;

        let mut workers = self.config.workers.max(1);
        if let Some(cap) = cap {
            if workers > cap {
                warn!(
                    "Transport settles at most {} deliveries at a time; using {} worker(s) instead of {}",
                    cap, cap, workers
                );
                workers = cap;
            }
        }

        let dispatch = Arc::new(Dispatch {
            connection: self.connection.clone(),
            handler,
            dead_letters: self.dead_letters.clone(),
            metrics: self.metrics.clone(),
            policy: self.config.policy,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            dispatch,
            queue.to_string(),
            workers,
            self.config.poll_interval,
            cancel.clone(),
        ));

        info!(queue = %queue, workers, "Subscribed");
        Ok(SubscriptionHandle {
            queue: queue.to_string(),
            workers,
            cancel,
            task,
        })
    }
}

type Job = (Delivery, OwnedSemaphorePermit);

async fn receive_loop<H: MessageHandler>(
    dispatch: Arc<Dispatch<H>>,
    queue: String,
    workers: usize,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<(), SubscribeError> {
    let permits = Arc::new(Semaphore::new(workers));
    let (tx, rx) = mpsc::channel::<Job>(workers);
    let rx = Arc::new(Mutex::new(rx));

    let pool: Vec<JoinHandle<()>> = (0..workers)
        .map(|id| tokio::spawn(worker_loop(id, dispatch.clone(), rx.clone())))
        .collect();

    let mut outcome = Ok(());
    'receive: loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = loop {
            if cancel.is_cancelled() {
                break 'receive;
            }
            match dispatch.connection.next_delivery(poll_interval).await {
                Ok(Some(delivery)) => break delivery,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    error!(queue = %queue, "Subscription lost: {}", e);
                    outcome = Err(SubscribeError::Lost {
                        queue: queue.clone(),
                        source: e,
                    });
                    break 'receive;
                }
                Err(e) => {
                    warn!(queue = %queue, "Receive failed, retrying: {}", e);
                    tokio::time::sleep(poll_interval).await;
                }
            }
        };

        debug!(
            queue = %queue,
            correlation_id = %delivery.correlation_id(),
            state = %DeliveryState::Delivered,
            "Received message"
        );
        if tx.send((delivery, permit)).await.is_err() {
            break;
        }
    }

    // Workers drain what was already handed over, then see the closed channel.
    drop(tx);
    for result in join_all(pool).await {
        if let Err(e) = result {
            error!(queue = %queue, "Worker panicked: {}", e);
        }
    }
    info!(queue = %queue, "Subscription stopped");
    outcome
}

async fn worker_loop<H: MessageHandler>(
    id: usize,
    dispatch: Arc<Dispatch<H>>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    debug!("Worker {} started", id);
    loop {
        let next = rx.lock().await.recv().await;
        let Some((delivery, permit)) = next else {
            break;
        };
        dispatch.process(delivery).await;
        drop(permit);
    }
    debug!("Worker {} stopped", id);
}

struct Dispatch<H> {
    connection: Arc<BrokerConnection>,
    handler: Arc<H>,
    dead_letters: Arc<DeadLetterQueue>,
    metrics: Arc<NotificationMetrics>,
    policy: RedeliveryPolicy,
}

impl<H: MessageHandler> Dispatch<H> {
    async fn process(&self, delivery: Delivery) -> DeliveryState {
        let span = info_span!(
            "delivery",
            queue = %delivery.queue,
            correlation_id = %delivery.correlation_id(),
            delivery_count = delivery.delivery_count,
        );
        async {
            NotificationMetrics::incr(&self.metrics.messages_received);
            debug!(state = %DeliveryState::Processing, "Handling message");

            let start = Instant::now();
            let result = self.handler.handle(&delivery).await;
            self.metrics.record_handler_latency(start.elapsed());

            let state = match result {
                Ok(()) => self.acknowledge(&delivery).await,
                Err(e) => {
                    NotificationMetrics::incr(&self.metrics.handler_errors);
                    warn!(permanent = e.is_permanent(), "Handler failed: {}", e);
                    self.recover(&delivery, &e).await
                }
            };
            info!(state = %state, "Message settled");
            state
        }
        .instrument(span)
        .await
    }

    async fn acknowledge(&self, delivery: &Delivery) -> DeliveryState {
        match self.connection.ack(delivery).await {
            Ok(()) => {
                NotificationMetrics::incr(&self.metrics.messages_acked);
                DeliveryState::Acknowledged
            }
            Err(e) => {
                NotificationMetrics::incr(&self.metrics.settle_errors);
                error!("Ack failed, message will be redelivered: {}", e);
                DeliveryState::Unsettled
            }
        }
    }

    async fn requeue(&self, delivery: &Delivery) -> DeliveryState {
        match self.connection.reject(delivery, true).await {
            Ok(()) => {
                NotificationMetrics::incr(&self.metrics.messages_redelivered);
                DeliveryState::Redelivered
            }
            Err(e) => {
                NotificationMetrics::incr(&self.metrics.settle_errors);
                error!("Requeue failed: {}", e);
                DeliveryState::Unsettled
            }
        }
    }

    async fn recover(&self, delivery: &Delivery, failure: &H::Error) -> DeliveryState {
        match self
            .policy
            .decide(delivery.delivery_count, failure.is_permanent())
        {
            RedeliveryDecision::Redeliver { after } => {
                debug!("Requeueing after {:?}", after);
                tokio::time::sleep(after).await;
                self.requeue(delivery).await
            }
            RedeliveryDecision::DeadLetter(kind) => {
                let reason = failure.to_string();
                match self.dead_letters.send_to_dlq(delivery, &reason, kind).await {
                    Ok(()) => match self.acknowledge(delivery).await {
                        DeliveryState::Acknowledged => DeliveryState::DeadLettered,
                        other => other,
                    },
                    // Never drop a message that did not reach the dead-letter queue.
                    Err(_) => {
                        tokio::time::sleep(self.policy.backoff_for(delivery.delivery_count)).await;
                        self.requeue(delivery).await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::broker_abstraction::{BrokerChannel, MessageProperties};
    use crate::infrastructure::broker_connection::BrokerEndpoint;
    use crate::infrastructure::in_memory_broker::{InMemoryBroker, InMemoryChannel};
    use crate::infrastructure::publisher::Publisher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (permanent={})", self.0)
        }
    }

    impl HandlerFailure for Flaky {
        fn is_permanent(&self) -> bool {
            self.0
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct Counting {
        calls: AtomicUsize,
        failures: usize,
        permanent: bool,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        type Error = Flaky;

        async fn handle(&self, _delivery: &Delivery) -> Result<(), Flaky> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Flaky(self.permanent))
            } else {
                Ok(())
            }
        }
    }

    fn setup(name: &str, max_deliveries: u32) -> (Subscriber, Arc<Publisher>, InMemoryBroker) {
        let connection = Arc::new(BrokerConnection::lazy(
            BrokerEndpoint::Memory(name.to_string()),
            Duration::from_secs(1),
        ));
        let metrics = Arc::new(NotificationMetrics::default());
        let publisher = Arc::new(Publisher::new(connection.clone(), metrics.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(publisher.clone(), metrics.clone()));
        let config = SubscriberConfig {
            workers: 1,
            policy: RedeliveryPolicy {
                max_deliveries,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(5),
            },
            poll_interval: Duration::from_millis(10),
        };
        (
            Subscriber::new(connection, dlq, metrics, config),
            publisher,
            InMemoryBroker::named(name),
        )
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_transient_failures_are_redelivered_then_acked() {
        let (subscriber, publisher, broker) = setup("subscriber-transient-test", 0);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: 2,
            permanent: false,
        });
        publisher.publish("jobs", b"{}").await.unwrap();

        let handle = subscriber.subscribe("jobs", handler.clone()).await.unwrap();
        wait_until(|| broker.acked_count("jobs") == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.ready_count("jobs"), 0);
        assert_eq!(broker.ready_count("jobs.dead_letter"), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered_once() {
        let (subscriber, publisher, broker) = setup("subscriber-permanent-test", 5);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            permanent: true,
        });
        publisher
            .publish_with("jobs", b"junk", &MessageProperties::persistent_json("m-1"))
            .await
            .unwrap();

        let handle = subscriber.subscribe("jobs", handler.clone()).await.unwrap();
        wait_until(|| broker.ready_count("jobs.dead_letter") == 1).await;
        wait_until(|| broker.acked_count("jobs") == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_deliveries_are_dead_lettered() {
        let (subscriber, publisher, broker) = setup("subscriber-exhausted-test", 3);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            permanent: false,
        });
        publisher.publish("jobs", b"{}").await.unwrap();

        let handle = subscriber.subscribe("jobs", handler.clone()).await.unwrap();
        wait_until(|| broker.ready_count("jobs.dead_letter") == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(broker.ready_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_an_idle_subscription() {
        let (subscriber, _publisher, _broker) = setup("subscriber-idle-test", 5);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: 0,
            permanent: false,
        });
        let handle = subscriber.subscribe("jobs", handler).await.unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.workers(), 1);
        handle.shutdown().await.unwrap();
    }

    /// Passes everything through except publishes to dead-letter queues.
    struct NoDeadLetters(InMemoryChannel);

    #[async_trait]
    impl BrokerChannel for NoDeadLetters {
        async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
            self.0.declare_queue(spec).await
        }
        async fn publish(
            &self,
            queue: &str,
            payload: &[u8],
            properties: &MessageProperties,
        ) -> Result<(), BrokerError> {
            if queue.ends_with(".dead_letter") {
                return Err(BrokerError::Transport("dead-letter queue unavailable".to_string()));
            }
            self.0.publish(queue, payload, properties).await
        }
        async fn consume(&self, queue: &str) -> Result<(), BrokerError> {
            self.0.consume(queue).await
        }
        async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.0.next_delivery(wait).await
        }
        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.0.ack(delivery).await
        }
        async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
            self.0.reject(delivery, requeue).await
        }
        async fn close(&self) -> Result<(), BrokerError> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_dead_letter_publish_requeues_original() {
        let broker = InMemoryBroker::named("subscriber-dlq-down-test");
        let connection = Arc::new(BrokerConnection::from_channel(Arc::new(NoDeadLetters(
            broker.open_channel(),
        ))));
        let metrics = Arc::new(NotificationMetrics::default());
        let publisher = Arc::new(Publisher::new(connection.clone(), metrics.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(publisher.clone(), metrics.clone()));
        let config = SubscriberConfig {
            workers: 1,
            policy: RedeliveryPolicy {
                max_deliveries: 5,
                // Holds the requeue long enough to shut down after one attempt.
                backoff_base: Duration::from_millis(200),
                backoff_max: Duration::from_millis(200),
            },
            poll_interval: Duration::from_millis(10),
        };
        let subscriber = Subscriber::new(connection, dlq, metrics.clone(), config);
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            failures: usize::MAX,
            permanent: true,
        });
        publisher.publish("jobs", b"junk").await.unwrap();

        let handle = subscriber.subscribe("jobs", handler.clone()).await.unwrap();
        wait_until(|| metrics.dlq_publish_failures.load(Ordering::SeqCst) == 1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.dlq_publish_failures.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.messages_redelivered.load(Ordering::SeqCst), 1);
        assert_eq!(broker.acked_count("jobs"), 0);
        assert_eq!(broker.ready_count("jobs"), 1);
        assert_eq!(broker.ready_count("jobs.dead_letter"), 0);
    }
}

//! In-process broker with queue semantics: ready and unacknowledged sets,
//! requeue on reject or channel loss, and durability across a simulated
//! restart.
//!
//! Brokers are addressable by name (`memory://<name>`) so that the account
//! service and the notification service of one process, or of one test,
//! reach the same queues through separate connections.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::infrastructure::broker_abstraction::{
    BrokerChannel, BrokerError, Delivery, DeliveryTag, MessageProperties, QueueSpec,
};

static BROKERS: LazyLock<DashMap<String, InMemoryBroker>> = LazyLock::new(DashMap::new);

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    properties: MessageProperties,
    delivery_count: u32,
}

#[derive(Debug)]
struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    acked: u64,
    discarded: u64,
}

impl QueueState {
    fn requeue(&mut self, mut tags: Vec<u64>) {
        // Oldest delivery ends up at the head.
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(unacked.message);
            }
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    consumers: HashMap<u64, String>,
    next_tag: u64,
    next_channel: u64,
    epoch: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide broker registered under `name`, creating it on first use.
    pub fn named(name: &str) -> Self {
        BROKERS
            .entry(name.to_string())
            .or_insert_with(InMemoryBroker::new)
            .clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn open_channel(&self) -> InMemoryChannel {
        let mut state = self.lock();
        state.next_channel += 1;
        InMemoryChannel {
            broker: self.clone(),
            id: state.next_channel,
            epoch: state.epoch,
            closed: AtomicBool::new(false),
        }
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn acked_count(&self, queue: &str) -> u64 {
        self.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    /// Payloads waiting in `queue`, head first.
    pub fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Simulates a broker restart: every open channel dies, unacknowledged
    /// messages return to their queues, transient queues and non-persistent
    /// messages are lost.
    pub fn restart(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.consumers.clear();
        state.queues.retain(|_, q| q.durable);
        for queue in state.queues.values_mut() {
            let tags: Vec<u64> = queue.unacked.keys().copied().collect();
            queue.requeue(tags);
            queue.ready.retain(|m| m.properties.persistent);
        }
        info!("In-memory broker restarted (epoch {})", state.epoch);
        drop(state);
        self.notify.notify_waiters();
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    epoch: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ChannelClosed);
        }
        let state = self.broker.lock();
        if state.epoch != self.epoch {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(state)
    }

    fn try_take(&self) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.live_state()?;
        let queue_name = state
            .consumers
            .get(&self.id)
            .cloned()
            .ok_or(BrokerError::NotConsuming)?;

        state.next_tag += 1;
        let tag = state.next_tag;
        let queue = state
            .queues
            .get_mut(&queue_name)
            .ok_or_else(|| BrokerError::QueueNotFound(queue_name.clone()))?;

        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        message.delivery_count += 1;

        let delivery = Delivery {
            queue: queue_name,
            tag: DeliveryTag::Sequence(tag),
            payload: message.payload.clone(),
            properties: message.properties.clone(),
            delivery_count: message.delivery_count,
        };
        queue.unacked.insert(
            tag,
            Unacked {
                channel_id: self.id,
                message,
            },
        );
        Ok(Some(delivery))
    }

    fn settle(&self, delivery: &Delivery, outcome: Settlement) -> Result<(), BrokerError> {
        let DeliveryTag::Sequence(tag) = delivery.tag else {
            return Err(BrokerError::UnknownDelivery(delivery.tag));
        };
        let mut state = self.live_state()?;
        let queue = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(delivery.queue.clone()))?;

        match queue.unacked.get(&tag) {
            Some(unacked) if unacked.channel_id == self.id => {}
            _ => return Err(BrokerError::UnknownDelivery(delivery.tag)),
        }

        match outcome {
            Settlement::Ack => {
                queue.unacked.remove(&tag);
                queue.acked += 1;
            }
            Settlement::Requeue => queue.requeue(vec![tag]),
            Settlement::Discard => {
                queue.unacked.remove(&tag);
                queue.discarded += 1;
            }
        }
        drop(state);

        if outcome == Settlement::Requeue {
            self.broker.notify.notify_waiters();
        }
        Ok(())
    }

    /// Returns every message this channel still holds to its queue.
    fn release(&self) {
        let mut state = self.broker.lock();
        state.consumers.remove(&self.id);
        if state.epoch != self.epoch {
            return;
        }
        let id = self.id;
        for queue in state.queues.values_mut() {
            let held: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == id)
                .map(|(tag, _)| *tag)
                .collect();
            if !held.is_empty() {
                debug!("Requeueing {} unacknowledged deliveries", held.len());
                queue.requeue(held);
            }
        }
        drop(state);
        self.broker.notify.notify_waiters();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    Discard,
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        match state.queues.get(&spec.name) {
            Some(existing) if existing.durable != spec.durable => {
                Err(BrokerError::PreconditionFailed {
                    queue: spec.name.clone(),
                    reason: format!(
                        "declared durable={} but queue exists with durable={}",
                        spec.durable, existing.durable
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        durable: spec.durable,
                        ..Default::default()
                    },
                );
                debug!("Declared queue '{}' (durable={})", spec.name, spec.durable);
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        target.ready.push_back(StoredMessage {
            payload: payload.to_vec(),
            properties: properties.clone(),
            delivery_count: 0,
        });
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        state.consumers.insert(self.id, queue.to_string());
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.broker.notify.notified();
            if let Some(delivery) = self.try_take()? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.settle(delivery, Settlement::Ack)
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let outcome = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.settle(delivery, outcome)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "user_registration";

    async fn declared() -> (InMemoryBroker, InMemoryChannel) {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel();
        channel.declare_queue(&QueueSpec::durable(Q)).await.unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn test_declare_is_idempotent() {
        let (broker, channel) = declared().await;
        channel.declare_queue(&QueueSpec::durable(Q)).await.unwrap();
        assert_eq!(broker.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_durability_mismatch_is_precondition_failure() {
        let (_broker, channel) = declared().await;
        let err = channel
            .declare_queue(&QueueSpec::transient(Q))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel();
        let err = channel
            .publish("nope", b"{}", &MessageProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn test_deliveries_are_fifo_and_ack_removes() {
        let (broker, channel) = declared().await;
        for body in [b"1", b"2"] {
            channel
                .publish(Q, body, &MessageProperties::default())
                .await
                .unwrap();
        }
        channel.consume(Q).await.unwrap();

        let first = channel.next_delivery(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = channel.next_delivery(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(second.payload, b"2");
        assert_eq!(broker.unacked_count(Q), 2);

        channel.ack(&first).await.unwrap();
        channel.ack(&second).await.unwrap();
        assert_eq!(broker.acked_count(Q), 2);
        assert_eq!(broker.unacked_count(Q), 0);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_at_head_with_count() {
        let (_broker, channel) = declared().await;
        channel.publish(Q, b"a", &MessageProperties::default()).await.unwrap();
        channel.publish(Q, b"b", &MessageProperties::default()).await.unwrap();
        channel.consume(Q).await.unwrap();

        let first = channel.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        channel.reject(&first, true).await.unwrap();

        let again = channel.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn test_double_ack_is_unknown_delivery() {
        let (_broker, channel) = declared().await;
        channel.publish(Q, b"a", &MessageProperties::default()).await.unwrap();
        channel.consume(Q).await.unwrap();
        let delivery = channel.next_delivery(Duration::ZERO).await.unwrap().unwrap();
        channel.ack(&delivery).await.unwrap();
        assert!(matches!(
            channel.ack(&delivery).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let (broker, channel) = declared().await;
        channel.publish(Q, b"a", &MessageProperties::default()).await.unwrap();
        channel.consume(Q).await.unwrap();
        let _held = channel.next_delivery(Duration::ZERO).await.unwrap().unwrap();

        channel.close().await.unwrap();
        assert_eq!(broker.ready_count(Q), 1);
        assert!(matches!(
            channel.publish(Q, b"b", &MessageProperties::default()).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_next_delivery_wakes_on_publish() {
        let (broker, consumer) = declared().await;
        consumer.consume(Q).await.unwrap();
        let producer = broker.open_channel();

        let waiter = tokio::spawn(async move {
            consumer.next_delivery(Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        producer.publish(Q, b"late", &MessageProperties::default()).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_restart_keeps_durable_persistent_messages_only() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel();
        channel.declare_queue(&QueueSpec::durable(Q)).await.unwrap();
        channel.declare_queue(&QueueSpec::transient("scratch")).await.unwrap();

        let transient = MessageProperties {
            persistent: false,
            ..Default::default()
        };
        channel.publish(Q, b"kept", &MessageProperties::default()).await.unwrap();
        channel.publish(Q, b"lost", &transient).await.unwrap();
        channel.publish("scratch", b"gone", &MessageProperties::default()).await.unwrap();

        broker.restart();

        assert!(broker.has_queue(Q));
        assert!(!broker.has_queue("scratch"));
        assert_eq!(broker.ready_payloads(Q), vec![b"kept".to_vec()]);
        assert!(matches!(
            channel.consume(Q).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_named_brokers_are_shared() {
        let a = InMemoryBroker::named("in-memory-broker-shared-test");
        let b = InMemoryBroker::named("in-memory-broker-shared-test");
        a.open_channel()
            .declare_queue(&QueueSpec::durable(Q))
            .await
            .unwrap();
        assert!(b.has_queue(Q));
    }
}

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct NotificationMetrics {
    // Publisher metrics
    pub messages_published: AtomicU64,
    pub publish_errors: AtomicU64,
    pub publish_latency: AtomicU64, // in milliseconds

    // Subscriber metrics
    pub messages_received: AtomicU64,
    pub messages_acked: AtomicU64,
    pub messages_redelivered: AtomicU64,
    pub settle_errors: AtomicU64,

    // Handler metrics
    pub emails_sent: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub handler_errors: AtomicU64,
    pub handler_latency: AtomicU64, // in milliseconds

    // DLQ metrics
    pub dlq_messages: AtomicU64,
    pub dlq_publish_failures: AtomicU64,
}

/// Point-in-time copy of the counters, served on the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub publish_errors: u64,
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_redelivered: u64,
    pub emails_sent: u64,
    pub duplicates_skipped: u64,
    pub handler_errors: u64,
    pub dlq_messages: u64,
    pub average_handler_latency_ms: f64,
    pub error_rate: f64,
}

impl NotificationMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_latency(&self, duration: Duration) {
        self.publish_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_handler_latency(&self, duration: Duration) {
        self.handler_latency
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn get_average_publish_latency(&self) -> f64 {
        let total = self.publish_latency.load(Ordering::Relaxed);
        let count = self.messages_published.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn get_average_handler_latency(&self) -> f64 {
        let total = self.handler_latency.load(Ordering::Relaxed);
        let count = self.messages_received.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn get_error_rate(&self) -> f64 {
        let errors = self.publish_errors.load(Ordering::Relaxed)
            + self.handler_errors.load(Ordering::Relaxed)
            + self.settle_errors.load(Ordering::Relaxed);
        let total = self.messages_published.load(Ordering::Relaxed)
            + self.messages_received.load(Ordering::Relaxed);

        if total > 0 {
            errors as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_redelivered: self.messages_redelivered.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            dlq_messages: self.dlq_messages.load(Ordering::Relaxed),
            average_handler_latency_ms: self.get_average_handler_latency(),
            error_rate: self.get_error_rate(),
        }
    }
}

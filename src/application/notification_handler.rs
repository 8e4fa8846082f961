use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::events::{MalformedEventError, RegistrationEvent};
use crate::infrastructure::broker_abstraction::Delivery;
use crate::infrastructure::email_dispatcher::{DeliveryError, EmailDispatcher};
use crate::infrastructure::metrics::NotificationMetrics;
use crate::infrastructure::subscriber::{HandlerFailure, MessageHandler};

const RECENT_DISPATCH_PRUNE_THRESHOLD: usize = 1024;
const RECENT_DISPATCH_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Malformed(#[from] MalformedEventError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl HandlerError {
    pub fn is_permanent(&self) -> bool {
        match self {
            HandlerError::Malformed(_) => true,
            HandlerError::Delivery(e) => e.is_permanent(),
        }
    }
}

impl HandlerFailure for HandlerError {
    fn is_permanent(&self) -> bool {
        HandlerError::is_permanent(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeMessage {
    pub subject: String,
    pub body: String,
}

impl WelcomeMessage {
    pub fn compose(event: &RegistrationEvent, app_name: &str) -> Self {
        Self {
            subject: format!("Welcome to {}!", app_name),
            body: format!(
                "Hello {},\n\nThank you for signing up as a {}. We're excited to have you on board!",
                event.fullname.display_name(),
                event.role
            ),
        }
    }
}

/// Turns registration events into welcome emails.
pub struct NotificationHandler {
    dispatcher: Arc<dyn EmailDispatcher>,
    metrics: Arc<NotificationMetrics>,
    app_name: String,
    // Account ids already welcomed, so a redelivery after a lost ack sends nothing.
    recent: DashMap<String, Instant>,
    dedupe_ttl: Duration,
    last_prune: Mutex<Instant>,
}

impl NotificationHandler {
    pub fn new(
        dispatcher: Arc<dyn EmailDispatcher>,
        metrics: Arc<NotificationMetrics>,
        app_name: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            metrics,
            app_name: app_name.into(),
            recent: DashMap::new(),
            dedupe_ttl: Duration::from_secs(24 * 60 * 60),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    pub fn with_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    fn recently_sent(&self, account_id: &str) -> bool {
        self.recent
            .get(account_id)
            .map(|sent_at| sent_at.elapsed() < self.dedupe_ttl)
            .unwrap_or(false)
    }

    fn remember(&self, account_id: &str) {
        self.recent.insert(account_id.to_string(), Instant::now());
        if self.recent.len() > RECENT_DISPATCH_PRUNE_THRESHOLD {
            self.prune_expired();
        }
    }

    /// Drops expired entries, at most once per interval so a large live set
    /// is not rescanned on every send.
    fn prune_expired(&self) {
        let interval = self.dedupe_ttl.min(RECENT_DISPATCH_PRUNE_INTERVAL);
        {
            let mut last_prune = self
                .last_prune
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last_prune.elapsed() < interval {
                return;
            }
            *last_prune = Instant::now();
        }
        let ttl = self.dedupe_ttl;
        self.recent.retain(|_, sent_at| sent_at.elapsed() < ttl);
        debug!(remaining = self.recent.len(), "Pruned recent dispatch guard");
    }

    /// Validates the event and sends the welcome email. The result of the
    /// send is returned unchanged.
    pub async fn handle(&self, event: &RegistrationEvent) -> Result<(), HandlerError> {
        event.ensure_valid()?;

        if self.recently_sent(&event.account_id) {
            NotificationMetrics::incr(&self.metrics.duplicates_skipped);
            info!(
                account_id = %event.account_id,
                "Welcome email already sent, skipping duplicate"
            );
            return Ok(());
        }

        let message = WelcomeMessage::compose(event, &self.app_name);
        self.dispatcher
            .send(&event.email, &message.subject, &message.body)
            .await?;

        self.remember(&event.account_id);
        NotificationMetrics::incr(&self.metrics.emails_sent);
        info!(account_id = %event.account_id, role = %event.role, "Welcome email sent");
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    type Error = HandlerError;

    async fn handle(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let event = RegistrationEvent::from_payload(&delivery.payload)?;
        debug!(account_id = %event.account_id, "Decoded registration event");
        NotificationHandler::handle(self, &event).await
    }
}

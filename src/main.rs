//! Notification service: consumes registration events and sends welcome emails.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use sangeet_events::application::NotificationHandler;
use sangeet_events::domain::USER_REGISTRATION_QUEUE;
use sangeet_events::infrastructure::config::{
    subscriber_config_from_env, BrokerConfig, MailConfig, MailTransport, ServiceConfig,
    NOTIFICATION_SERVICE_PORT,
};
use sangeet_events::infrastructure::logging::{init_logging, LoggingConfig};
use sangeet_events::infrastructure::shutdown::ShutdownManager;
use sangeet_events::infrastructure::{
    BrokerConnection, DeadLetterQueue, EmailDispatcher, LogEmailDispatcher, NotificationMetrics,
    Publisher, SmtpEmailDispatcher, Subscriber,
};
use sangeet_events::web::create_notification_router;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let service = ServiceConfig::from_env(NOTIFICATION_SERVICE_PORT)?;
    let _log_guard = init_logging(&LoggingConfig {
        service_name: "notification-service".to_string(),
        ..service.logging.clone()
    })
    .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    info!("Starting notification service");

    let broker = BrokerConfig::from_env()?;
    let subscriber_config = subscriber_config_from_env()?;
    let mail = MailConfig::from_env()?;

    let dispatcher: Arc<dyn EmailDispatcher> = match mail.transport {
        MailTransport::Smtp(settings) => Arc::new(SmtpEmailDispatcher::new(settings)?),
        MailTransport::Log => Arc::new(LogEmailDispatcher),
    };
    dispatcher
        .verify()
        .await
        .context("mail transport verification failed")?;

    let connection = Arc::new(
        BrokerConnection::connect_with(&broker.uri, &broker.settings)
            .await
            .context("cannot start without the message broker")?,
    );

    let metrics = Arc::new(NotificationMetrics::default());
    let publisher = Arc::new(Publisher::new(connection.clone(), metrics.clone()));
    let dead_letters = Arc::new(DeadLetterQueue::new(publisher, metrics.clone()));
    let subscriber = Subscriber::new(
        connection.clone(),
        dead_letters,
        metrics.clone(),
        subscriber_config,
    );
    let handler = Arc::new(NotificationHandler::new(
        dispatcher,
        metrics.clone(),
        mail.app_name,
    ));

    let subscription = subscriber
        .subscribe(USER_REGISTRATION_QUEUE, handler)
        .await
        .context("failed to subscribe to registration events")?;

    let shutdown = ShutdownManager::new();
    shutdown.listen_for_signals();
    {
        let shutdown = shutdown.clone();
        let subscription_token = subscription.cancellation_token();
        tokio::spawn(async move {
            shutdown.wait().await;
            subscription_token.cancel();
        });
    }

    let addr = format!("0.0.0.0:{}", service.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Health endpoint listening on {}", addr);
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, create_notification_router(metrics))
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        })
    };

    // Ends on shutdown, or early if the broker connection is lost.
    let outcome = subscription.join().await;
    if let Err(e) = &outcome {
        error!("Subscription ended: {}", e);
    }
    shutdown.trigger();

    if let Err(e) = server.await? {
        error!("Health server error: {}", e);
    }
    if let Err(e) = connection.close().await {
        error!("Failed to close broker connection: {}", e);
    }

    info!("Notification service stopped");
    outcome.map_err(Into::into)
}

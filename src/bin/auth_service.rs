//! Account service: registers users and announces each new account.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use sangeet_events::application::RegistrationService;
use sangeet_events::infrastructure::config::{BrokerConfig, ServiceConfig, AUTH_SERVICE_PORT};
use sangeet_events::infrastructure::logging::{init_logging, LoggingConfig};
use sangeet_events::infrastructure::shutdown::ShutdownManager;
use sangeet_events::infrastructure::{
    BrokerConnection, InMemoryUserRepository, NotificationMetrics, Publisher,
};
use sangeet_events::web::create_auth_router;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let service = ServiceConfig::from_env(AUTH_SERVICE_PORT)?;
    let _log_guard = init_logging(&LoggingConfig {
        service_name: "auth-service".to_string(),
        ..service.logging.clone()
    })
    .map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    info!("Starting auth service");

    let broker = BrokerConfig::from_env()?;
    let connection = Arc::new(
        BrokerConnection::connect_with(&broker.uri, &broker.settings)
            .await
            .context("cannot start without the message broker")?,
    );

    let metrics = Arc::new(NotificationMetrics::default());
    let publisher = Arc::new(Publisher::new(connection.clone(), metrics));
    let registration = Arc::new(RegistrationService::new(
        Arc::new(InMemoryUserRepository::new()),
        publisher,
    ));

    let shutdown = ShutdownManager::new();
    shutdown.listen_for_signals();
    // A failed broker connection ends the process with an error.
    let broker_watch = shutdown.trigger_on_broker_failure(connection.clone());

    let addr = format!("0.0.0.0:{}", service.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Auth service listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, create_auth_router(registration))
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await?;

    shutdown.trigger();
    let broker_failed = broker_watch.await?;
    if let Err(e) = connection.close().await {
        error!("Failed to close broker connection: {}", e);
    }
    info!("Auth service stopped");

    if broker_failed {
        return Err(anyhow!("broker connection to {} was lost", connection.describe()));
    }
    Ok(())
}

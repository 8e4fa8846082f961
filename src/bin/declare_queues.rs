//! Declares the registration queue and its dead-letter queue on the configured broker.

use anyhow::{Context, Result};

use sangeet_events::domain::USER_REGISTRATION_QUEUE;
use sangeet_events::infrastructure::config::BrokerConfig;
use sangeet_events::infrastructure::{BrokerConnection, QueueSpec};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let broker = BrokerConfig::from_env()?;
    let connection = BrokerConnection::connect_with(&broker.uri, &broker.settings)
        .await
        .context("failed to connect to broker")?;

    let queue = QueueSpec::durable(USER_REGISTRATION_QUEUE);
    for spec in [queue.clone(), queue.dead_letter()] {
        match connection.declare_queue(&spec).await {
            Ok(()) => println!("Declared queue: {} (durable)", spec.name),
            Err(e) => {
                println!("Failed to declare queue {}: {}", spec.name, e);
                connection.close().await.ok();
                return Err(e.into());
            }
        }
    }

    connection.close().await?;
    Ok(())
}

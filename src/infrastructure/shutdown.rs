use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::infrastructure::broker_connection::BrokerConnection;

/// Process-wide shutdown signal shared by the HTTP server and the subscriber.
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown was triggered, by a signal or by `trigger`.
    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    /// Triggers shutdown once `connection` fails. The task yields `true` if
    /// it was the broker failure that stopped the process.
    pub fn trigger_on_broker_failure(&self, connection: Arc<BrokerConnection>) -> JoinHandle<bool> {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = connection.failed() => {
                    error!("Broker connection to {} failed, shutting down", connection.describe());
                    manager.trigger();
                    true
                }
                _ = manager.wait() => false,
            }
        })
    }

    /// Triggers shutdown on Ctrl-C or SIGTERM.
    pub fn listen_for_signals(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctrl_c() => info!("Received Ctrl-C"),
                _ = terminate() => info!("Received SIGTERM"),
                _ = manager.wait() => return,
            }
            manager.trigger();
        });
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

use async_trait::async_trait;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod agent;
pub mod gateway;
pub mod serve;
pub mod supervisor;

#[async_trait]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Token cancelled on the first Ctrl+C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => warn!(error = %err, "Failed to listen for Ctrl+C, shutting down"),
        }
        token.cancel();
    });
    shutdown
}

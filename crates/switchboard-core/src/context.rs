use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::{BrokerConnector, ChannelError, MessageChannel, connect_with_retry};
use crate::retry::RetryPolicy;

/// Connection state shared by the gateway, agents and supervisor drain of one
/// process. Created once at startup and handed to their constructors.
#[derive(Clone)]
pub struct ServiceContext {
    channel: Arc<dyn MessageChannel>,
    shutdown: CancellationToken,
}

impl ServiceContext {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self::with_shutdown(channel, CancellationToken::new())
    }

    pub fn with_shutdown(channel: Arc<dyn MessageChannel>, shutdown: CancellationToken) -> Self {
        Self { channel, shutdown }
    }

    pub async fn connect(
        connector: &dyn BrokerConnector,
        retry: &RetryPolicy,
        shutdown: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let channel = connect_with_retry(connector, retry).await?;
        Ok(Self::with_shutdown(channel, shutdown))
    }

    pub fn channel(&self) -> &Arc<dyn MessageChannel> {
        &self.channel
    }

    /// Token cancelled when this context shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Signals every task holding a shutdown token, then closes the channel.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        self.shutdown.cancel();
        info!("Closing broker channel");
        self.channel.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryBroker;

    #[tokio::test]
    async fn shutdown_cancels_tokens_and_closes_channel() {
        let broker = InMemoryBroker::new();
        let context = ServiceContext::new(Arc::new(broker.clone()));
        let token = context.shutdown_token();

        context.shutdown().await.unwrap();

        assert!(token.is_cancelled());
        assert!(context.is_shutting_down());
        assert!(matches!(
            broker.declare("q", true).await.unwrap_err(),
            ChannelError::Closed
        ));
    }
}

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{ChannelError, InMemoryBroker, MessageChannel, SqliteBroker, SqliteBrokerOptions};
use crate::retry::{RetryPolicy, retry_with_policy};

/// Establishes a channel connection. Retried as a whole by
/// [`connect_with_retry`].
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

pub struct SqliteConnector {
    options: SqliteBrokerOptions,
}

impl SqliteConnector {
    pub fn new(options: SqliteBrokerOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl BrokerConnector for SqliteConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let broker = SqliteBroker::open(&self.options).await?;
        Ok(Arc::new(broker))
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.options.path.display())
    }
}

/// Hands out clones of one shared [`InMemoryBroker`].
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        Ok(Arc::new(self.broker.clone()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Connects under `policy`. Exhaustion becomes [`ChannelError::Unavailable`];
/// non-retryable errors are returned as they are.
pub async fn connect_with_retry(
    connector: &dyn BrokerConnector,
    policy: &RetryPolicy,
) -> Result<Arc<dyn MessageChannel>, ChannelError> {
    let target = connector.describe();
    let channel = retry_with_policy(policy, &target, ChannelError::is_retryable, |attempt| {
        info!(target: "channel", broker = %target, attempt, "Connecting to broker");
        connector.connect()
    })
    .await
    .map_err(|exhausted| {
        if exhausted.last_error.is_retryable() {
            ChannelError::Unavailable {
                attempts: exhausted.attempts,
                message: exhausted.last_error.to_string(),
            }
        } else {
            exhausted.last_error
        }
    })?;

    info!(target: "channel", broker = %target, "Connected to broker");
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FlakyConnector;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn connects_when_broker_comes_up_on_third_attempt() {
        let connector = FlakyConnector::new(2, InMemoryBroker::new());
        let started = tokio::time::Instant::now();

        let channel = connect_with_retry(&connector, &RetryPolicy::default()).await;

        assert!(channel.is_ok());
        assert_eq!(connector.attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_is_reported_as_unavailable() {
        let connector = FlakyConnector::always_down();
        let err = connect_with_retry(&connector, &RetryPolicy::fixed(3, Duration::from_secs(1)))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ChannelError::Unavailable { attempts: 3, .. }));
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn sqlite_connector_opens_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let connector = SqliteConnector::new(SqliteBrokerOptions::new(
            dir.path().join("nested").join("broker.db"),
        ));
        let channel = connect_with_retry(&connector, &RetryPolicy::default())
            .await
            .unwrap();
        channel.declare("q", true).await.unwrap();
        assert!(connector.describe().ends_with("broker.db"));
    }
}

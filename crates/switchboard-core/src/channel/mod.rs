//! Durable named-queue broker abstraction.
//!
//! A [`MessageChannel`] declares queues, publishes bytes with transport
//! properties, and hands out [`Consumer`]s. Every [`Delivery`] carries an
//! [`Acker`] that settles it exactly once: `ack` and `reject` consume the
//! acker, so a delivery cannot be acknowledged twice.
//!
//! Persistent publishes on durable queues give at-least-once delivery;
//! consumers must tolerate redelivery.

mod connector;
mod memory;
mod sqlite;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::envelope::{CodecError, Envelope};
use crate::types::CorrelationId;

pub use connector::{BrokerConnector, InMemoryConnector, SqliteConnector, connect_with_retry};
pub use memory::{InMemoryBroker, QueueStats};
pub use sqlite::{SqliteBroker, SqliteBrokerOptions};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Broker unavailable after {attempts} attempts: {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("Queue not declared: {queue}")]
    QueueNotDeclared { queue: String },

    #[error("Queue {queue} already declared with durable={durable}")]
    DeclareMismatch { queue: String, durable: bool },

    #[error("Delivery {delivery_tag} is no longer outstanding")]
    UnknownDelivery { delivery_tag: u64 },

    #[error("Broker storage error: {message}")]
    Storage { message: String },

    #[error("Channel closed")]
    Closed,
}

impl ChannelError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether establishing a connection again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Storage { .. })
    }
}

/// Transport metadata attached to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub correlation_id: Option<CorrelationId>,
    pub reply_to: Option<String>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self::persistent()
    }
}

impl MessageProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn transient() -> Self {
        Self {
            persistent: false,
            ..Self::persistent()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Properties for a reply: persistent, with correlation metadata copied
    /// verbatim from the incoming message.
    pub fn reply_to_incoming(incoming: &MessageProperties) -> Self {
        Self {
            persistent: true,
            correlation_id: incoming.correlation_id.clone(),
            reply_to: incoming.reply_to.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

/// Backend-specific settlement of one outstanding delivery.
#[async_trait]
pub trait AckHandle: Send {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), ChannelError>;
}

/// Settles a single delivery. Consumed by `ack`/`reject`.
pub struct Acker {
    handle: Box<dyn AckHandle>,
}

impl Acker {
    pub fn new(handle: impl AckHandle + 'static) -> Self {
        Self {
            handle: Box::new(handle),
        }
    }

    pub async fn ack(self) -> Result<(), ChannelError> {
        self.handle.settle(Settlement::Ack).await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), ChannelError> {
        self.handle.settle(Settlement::Reject { requeue }).await
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
    pub acker: Acker,
}

#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the channel is closed.
    async fn next(&mut self) -> Option<Result<Delivery, ChannelError>>;
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Idempotently ensures `queue` exists.
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), ChannelError>;

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), ChannelError>;

    /// Starts a competing consumer on `queue`.
    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, ChannelError>;

    async fn close(&self) -> Result<(), ChannelError>;
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Encodes `envelope` and publishes it on `queue`.
pub async fn publish_envelope<E: Envelope + Sync>(
    channel: &Arc<dyn MessageChannel>,
    queue: &str,
    envelope: &E,
    properties: MessageProperties,
) -> Result<(), PublishError> {
    let body = envelope.encode()?;
    channel.publish(queue, body, properties).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_properties_copy_correlation_metadata() {
        let incoming = MessageProperties::transient()
            .with_correlation_id(CorrelationId::from_string("corr-1"))
            .with_reply_to("billing_responses");

        let reply = MessageProperties::reply_to_incoming(&incoming);
        assert!(reply.persistent);
        assert_eq!(reply.correlation_id, incoming.correlation_id);
        assert_eq!(reply.reply_to.as_deref(), Some("billing_responses"));
    }

    #[test]
    fn only_connection_level_errors_are_retryable() {
        assert!(ChannelError::connection("refused").is_retryable());
        assert!(ChannelError::storage("locked").is_retryable());
        assert!(!ChannelError::Closed.is_retryable());
        assert!(
            !ChannelError::QueueNotDeclared {
                queue: "x".to_string()
            }
            .is_retryable()
        );
    }
}

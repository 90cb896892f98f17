//! Gateway dispatcher: validates sessions, publishes requests to agent
//! queues, and answers response lookups.

mod responses;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::channel::{ChannelError, MessageChannel, MessageProperties, PublishError, publish_envelope};
use crate::config::SwitchboardConfig;
use crate::context::ServiceContext;
use crate::envelope::{AgentKind, RequestEnvelope, RequestType};
use crate::session::{SessionRecord, SessionStore, SessionStoreError};
use crate::types::{CorrelationId, RequestId, SessionId};

pub use responses::{
    Completion, DEFAULT_RESPONSE_TTL, InMemoryResponseStore, LookupResult, ResponseCollector, ResponseStore,
    ResponseStoreError, StoredResponse, collect_one,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: SessionId },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error(transparent)]
    Session(#[from] SessionStoreError),

    #[error(transparent)]
    Responses(#[from] ResponseStoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub session_id: SessionId,
    pub customer_id: String,
    pub agent: AgentKind,
    pub request_type: String,
    pub details: Value,
}

/// Acknowledgment returned as soon as a request is on its queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub request_id: RequestId,
    pub status: String,
    pub message: String,
}

fn agent_label(agent: AgentKind) -> &'static str {
    match agent {
        AgentKind::Billing => "Billing",
        AgentKind::International => "International calls",
    }
}

pub struct GatewayDispatcher {
    channel: Arc<dyn MessageChannel>,
    sessions: Arc<dyn SessionStore>,
    responses: Arc<dyn ResponseStore>,
}

impl GatewayDispatcher {
    pub fn new(
        context: &ServiceContext,
        sessions: Arc<dyn SessionStore>,
        responses: Arc<dyn ResponseStore>,
    ) -> Self {
        Self {
            channel: context.channel().clone(),
            sessions,
            responses,
        }
    }

    /// Gateway with the configured session store and an in-memory response
    /// store, its queues already declared.
    pub async fn from_config(
        context: &ServiceContext,
        config: &SwitchboardConfig,
    ) -> crate::Result<Self> {
        let sessions = config.open_session_store().await?;
        let responses = Arc::new(InMemoryResponseStore::with_ttl(config.response_ttl()));
        let gateway = Self::new(context, sessions, responses);
        gateway.declare_queues().await?;
        Ok(gateway)
    }

    pub fn responses(&self) -> &Arc<dyn ResponseStore> {
        &self.responses
    }

    /// Declares every agent's request and response queues.
    pub async fn declare_queues(&self) -> Result<(), ChannelError> {
        for agent in AgentKind::all() {
            self.channel.declare(&agent.requests_queue(), true).await?;
            self.channel.declare(&agent.responses_queue(), true).await?;
        }
        Ok(())
    }

    pub async fn create_session(
        &self,
        customer_id: &str,
        user_id: Option<String>,
    ) -> Result<SessionRecord, GatewayError> {
        if customer_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "customer_id must not be empty".to_string(),
            });
        }
        let record = SessionRecord::new(customer_id, user_id);
        self.sessions.put(&record).await?;
        info!(target: "gateway", session_id = %record.session_id, customer_id, "Session created");
        Ok(record)
    }

    /// The active session with this id.
    pub async fn session(&self, session_id: &SessionId) -> Result<SessionRecord, GatewayError> {
        match self.sessions.get(session_id).await? {
            Some(record) if record.active => Ok(record),
            _ => Err(GatewayError::SessionNotFound {
                session_id: session_id.clone(),
            }),
        }
    }

    /// Marks the session inactive. Later submits against it fail with
    /// `SessionNotFound`.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<SessionRecord, GatewayError> {
        let close = |record: &mut SessionRecord| record.active = false;
        let Some(record) = self.sessions.update_active(session_id, &close).await? else {
            return Err(GatewayError::SessionNotFound {
                session_id: session_id.clone(),
            });
        };
        info!(target: "gateway", %session_id, "Session closed");
        Ok(record)
    }

    /// Publishes a request to its agent's queue and returns immediately.
    /// Nothing is published unless the session resolves to an active record.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, GatewayError> {
        let SubmitRequest {
            session_id,
            customer_id,
            agent,
            request_type,
            details,
        } = request;

        if request_type.trim().is_empty() {
            return Err(GatewayError::InvalidRequest {
                message: "request_type must not be empty".to_string(),
            });
        }
        self.session(&session_id).await?;

        let envelope = RequestEnvelope::new(
            session_id.clone(),
            customer_id,
            RequestType::parse(&request_type),
            details,
        );
        let request_id = envelope.request_id.clone();
        let correlation_id = CorrelationId::new();
        let queue = agent.requests_queue();

        self.responses
            .record_pending(&request_id, &correlation_id, agent)
            .await?;

        let properties = MessageProperties::persistent()
            .with_correlation_id(correlation_id)
            .with_reply_to(agent.responses_queue());
        let published = async {
            self.channel.declare(&queue, true).await?;
            publish_envelope(&self.channel, &queue, &envelope, properties).await
        }
        .await;

        if let Err(err) = published {
            error!(target: "gateway", %request_id, %queue, error = %err, "Failed to publish request");
            if let Err(discard_err) = self.responses.discard(&request_id).await {
                warn!(target: "gateway", %request_id, error = %discard_err, "Failed to discard pending entry");
            }
            return Err(err.into());
        }

        // Conditional on the session still being active, so a close that
        // landed while publishing is never undone.
        let submitted = |record: &mut SessionRecord| {
            record.record_submission(agent, &request_id, envelope.request_type());
        };
        match self.sessions.update_active(&session_id, &submitted).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(target: "gateway", %session_id, %request_id, "Session closed while submitting");
            }
            // The request is already queued; the session just misses this update.
            Err(err) => {
                warn!(target: "gateway", %session_id, %request_id, error = %err, "Failed to update session");
            }
        }

        info!(
            target: "gateway",
            %request_id,
            %session_id,
            %queue,
            request_type = %envelope.request_type(),
            "Request submitted"
        );

        Ok(SubmitReceipt {
            request_id,
            status: "submitted".to_string(),
            message: format!("{} request submitted successfully", agent_label(agent)),
        })
    }

    /// Safe to call any number of times, before or after the response lands.
    pub async fn lookup(&self, request_id: &RequestId) -> Result<LookupResult, GatewayError> {
        Ok(self.responses.lookup(request_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Consumer, InMemoryBroker};
    use crate::envelope::{Envelope, ResponseEnvelope};
    use crate::session::InMemorySessionStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Closes a session the moment a request for it is published.
    struct CloseOnPublish {
        broker: InMemoryBroker,
        sessions: Arc<InMemorySessionStore>,
        target: Mutex<Option<SessionId>>,
    }

    #[async_trait]
    impl MessageChannel for CloseOnPublish {
        async fn declare(&self, queue: &str, durable: bool) -> Result<(), ChannelError> {
            self.broker.declare(queue, durable).await
        }

        async fn publish(
            &self,
            queue: &str,
            body: Vec<u8>,
            properties: MessageProperties,
        ) -> Result<(), ChannelError> {
            self.broker.publish(queue, body, properties).await?;
            let target = self.target.lock().unwrap().take();
            if let Some(session_id) = target {
                let close = |record: &mut SessionRecord| record.active = false;
                self.sessions.update_active(&session_id, &close).await.unwrap();
            }
            Ok(())
        }

        async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, ChannelError> {
            self.broker.consume(queue).await
        }

        async fn close(&self) -> Result<(), ChannelError> {
            self.broker.close().await
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        gateway: GatewayDispatcher,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let context = ServiceContext::new(Arc::new(broker.clone()));
        let gateway = GatewayDispatcher::new(
            &context,
            Arc::new(InMemorySessionStore::default()),
            Arc::new(InMemoryResponseStore::new()),
        );
        gateway.declare_queues().await.unwrap();
        Fixture { broker, gateway }
    }

    fn submit(session_id: &SessionId, agent: AgentKind, request_type: &str) -> SubmitRequest {
        SubmitRequest {
            session_id: session_id.clone(),
            customer_id: "cust-1".to_string(),
            agent,
            request_type: request_type.to_string(),
            details: json!({"amount": 10.0, "account_number": "A-1"}),
        }
    }

    #[tokio::test]
    async fn submit_publishes_with_correlation_and_updates_session() {
        let f = fixture().await;
        let session = f.gateway.create_session("cust-1", None).await.unwrap();

        let receipt = f
            .gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "refund_request"))
            .await
            .unwrap();

        assert_eq!(receipt.status, "submitted");
        assert_eq!(receipt.message, "Billing request submitted successfully");

        let queued = f.broker.ready_messages("billing_requests");
        assert_eq!(queued.len(), 1);
        let (body, props) = &queued[0];
        let envelope = RequestEnvelope::decode(body).unwrap();
        assert_eq!(envelope.request_id, receipt.request_id);
        assert_eq!(envelope.session_id, session.session_id);
        assert_eq!(
            envelope.raw_details(),
            &json!({"amount": 10.0, "account_number": "A-1"})
        );
        assert!(props.persistent);
        assert!(props.correlation_id.is_some());
        assert_eq!(props.reply_to.as_deref(), Some("billing_responses"));

        let updated = f.gateway.session(&session.session_id).await.unwrap();
        let last = updated.last_request.unwrap();
        assert_eq!(last.request_id, receipt.request_id);
        assert_eq!(last.agent, AgentKind::Billing);
        assert!(updated.agent_assignments.contains_key(&AgentKind::Billing));

        assert_eq!(
            f.gateway.lookup(&receipt.request_id).await.unwrap(),
            LookupResult::Pending
        );
    }

    #[tokio::test]
    async fn unknown_session_publishes_nothing() {
        let f = fixture().await;
        let err = f
            .gateway
            .submit(submit(&SessionId::new(), AgentKind::International, "rate_inquiry"))
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(f.broker.ready_messages("international_requests").is_empty());
        assert_eq!(f.broker.stats("international_requests").unwrap().published, 0);
    }

    #[tokio::test]
    async fn closed_session_rejects_submits() {
        let f = fixture().await;
        let session = f.gateway.create_session("cust-1", Some("ops".into())).await.unwrap();
        f.gateway.close_session(&session.session_id).await.unwrap();

        let err = f
            .gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "billing_inquiry"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(f.gateway.session(&session.session_id).await.is_err());
    }

    #[tokio::test]
    async fn close_during_submit_stays_closed() {
        let broker = InMemoryBroker::new();
        let sessions = Arc::new(InMemorySessionStore::default());
        let channel = Arc::new(CloseOnPublish {
            broker: broker.clone(),
            sessions: sessions.clone(),
            target: Mutex::new(None),
        });
        let context = ServiceContext::new(channel.clone());
        let gateway =
            GatewayDispatcher::new(&context, sessions, Arc::new(InMemoryResponseStore::new()));
        let session = gateway.create_session("cust-1", None).await.unwrap();
        *channel.target.lock().unwrap() = Some(session.session_id.clone());

        gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "billing_inquiry"))
            .await
            .unwrap();
        assert_eq!(broker.ready_messages("billing_requests").len(), 1);

        assert!(gateway.session(&session.session_id).await.unwrap_err().is_not_found());
        let err = gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "billing_inquiry"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(broker.ready_messages("billing_requests").len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_pending_entry() {
        let f = fixture().await;
        let session = f.gateway.create_session("cust-1", None).await.unwrap();
        f.broker.close().await.unwrap();

        let err = f
            .gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "billing_inquiry"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Publish(_)));
        let session = f.gateway.session(&session.session_id).await.unwrap();
        assert!(session.last_request.is_none());
    }

    #[tokio::test]
    async fn lookup_sees_collected_response() {
        let f = fixture().await;
        let session = f.gateway.create_session("cust-1", None).await.unwrap();
        let receipt = f
            .gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "billing_inquiry"))
            .await
            .unwrap();
        let (_, props) = f.broker.ready_messages("billing_requests").remove(0);

        f.broker
            .publish(
                "billing_responses",
                ResponseEnvelope::success(receipt.request_id.clone())
                    .encode()
                    .unwrap(),
                MessageProperties::reply_to_incoming(&props),
            )
            .await
            .unwrap();
        let mut consumer = f.broker.consume("billing_responses").await.unwrap();
        let delivery = consumer.next().await.unwrap().unwrap();
        assert!(collect_one(delivery, f.gateway.responses().as_ref()).await.unwrap());

        let LookupResult::Completed(stored) = f.gateway.lookup(&receipt.request_id).await.unwrap()
        else {
            panic!("expected completed response");
        };
        assert_eq!(stored.correlation_id, props.correlation_id);
        assert_eq!(
            f.gateway.lookup(&RequestId::new()).await.unwrap(),
            LookupResult::NotFound
        );
    }

    #[tokio::test]
    async fn blank_request_type_is_invalid() {
        let f = fixture().await;
        let session = f.gateway.create_session("cust-1", None).await.unwrap();
        let err = f
            .gateway
            .submit(submit(&session.session_id, AgentKind::Billing, "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest { .. }));
    }
}

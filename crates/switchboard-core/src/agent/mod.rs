//! Agent runtime: consumes one agent's request queue and dispatches each
//! request to the handler registered for its type.
//!
//! Per delivery the runtime walks `received -> classified -> {handled |
//! unknown_type | handler_error} -> acknowledged`. The response goes out
//! before any notification, and the delivery is settled last, exactly once.
//! If the channel fails while publishing, the delivery is requeued and the
//! error ends the run loop. A redelivery after a failed notification repeats
//! the response, which the gateway's response store drops as a duplicate;
//! a notification is never published twice for one failed attempt.

mod registry;
mod startup;
mod supervisor;

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{
    Acker, ChannelError, Delivery, MessageChannel, MessageProperties, PublishError,
    publish_envelope,
};
use crate::context::ServiceContext;
use crate::envelope::{
    AgentKind, Envelope, INVALID_ENVELOPE, MALFORMED_ENVELOPE, RequestEnvelope, ResponseEnvelope,
    SUPERVISOR_QUEUE, SupervisorNotification,
};

pub use registry::{HandlerError, HandlerOutcome, HandlerRegistry, RequestHandler};
pub use startup::{AgentExit, StartupOptions, StartupPolicy, launch_agent, run_passive};
pub use supervisor::{SupervisorNotifier, drain_notifications};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Broker unavailable at startup: {0}")]
    Unavailable(#[source] ChannelError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum DispatchOutcome {
    /// Response published, delivery acknowledged.
    Handled,
    /// Escalation notified, response published, delivery acknowledged.
    Escalated,
    /// Error response and notification published, delivery acknowledged.
    UnknownType,
    /// Notification published, delivery rejected without requeue.
    HandlerFailed,
    /// Undecodable envelope reported and acknowledged.
    Poison,
}

/// Counters for one run of [`AgentRuntime::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub handled: u64,
    pub escalated: u64,
    pub unknown_type: u64,
    pub handler_failed: u64,
    pub poison: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled => self.handled += 1,
            DispatchOutcome::Escalated => self.escalated += 1,
            DispatchOutcome::UnknownType => self.unknown_type += 1,
            DispatchOutcome::HandlerFailed => self.handler_failed += 1,
            DispatchOutcome::Poison => self.poison += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.handled + self.escalated + self.unknown_type + self.handler_failed + self.poison
    }
}

pub struct AgentRuntime {
    kind: AgentKind,
    channel: Arc<dyn MessageChannel>,
    registry: Arc<HandlerRegistry>,
    notifier: SupervisorNotifier,
}

impl AgentRuntime {
    pub fn new(context: &ServiceContext, kind: AgentKind, registry: Arc<HandlerRegistry>) -> Self {
        let channel = context.channel().clone();
        Self {
            kind,
            notifier: SupervisorNotifier::new(channel.clone()),
            channel,
            registry,
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    fn source(&self) -> String {
        self.kind.source_name()
    }

    /// Declares the inbound, outbound and supervisor queues, all durable.
    pub async fn declare_queues(&self) -> Result<(), ChannelError> {
        self.channel
            .declare(&self.kind.requests_queue(), true)
            .await?;
        self.channel
            .declare(&self.kind.responses_queue(), true)
            .await?;
        self.channel.declare(SUPERVISOR_QUEUE, true).await?;
        Ok(())
    }

    /// Consumes the request queue one message at a time until `shutdown`
    /// fires or the channel closes. An in-flight dispatch always runs to
    /// completion.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<RunSummary, RuntimeError> {
        let queue = self.kind.requests_queue();
        let mut consumer = self.channel.consume(&queue).await?;
        let mut summary = RunSummary::default();
        info!(target: "agent", agent = %self.kind, %queue, "Agent consuming");

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(target: "agent", agent = %self.kind, "Shutdown requested");
                    break;
                }
                next = consumer.next() => next,
            };

            match next {
                None => {
                    info!(target: "agent", agent = %self.kind, "Channel closed");
                    break;
                }
                Some(Err(err)) => {
                    error!(target: "agent", agent = %self.kind, error = %err, "Transport error while consuming");
                    return Err(err.into());
                }
                Some(Ok(delivery)) => {
                    let outcome = self.dispatch(delivery).await?;
                    summary.record(outcome);
                }
            }
        }

        info!(
            target: "agent",
            agent = %self.kind,
            processed = summary.total(),
            "Agent stopped"
        );
        Ok(summary)
    }

    /// Processes a single delivery and settles it.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<DispatchOutcome, RuntimeError> {
        let Delivery {
            delivery_tag,
            body,
            properties,
            redelivered,
            acker,
            ..
        } = delivery;

        let request = match RequestEnvelope::decode(&body) {
            Ok(request) => request,
            Err(err) => {
                let kind = if err.is_malformed() {
                    MALFORMED_ENVELOPE
                } else {
                    INVALID_ENVELOPE
                };
                warn!(
                    target: "agent::dispatch",
                    agent = %self.kind,
                    delivery_tag,
                    error = %err,
                    "Undecodable request"
                );
                let notification =
                    SupervisorNotification::undeliverable(self.source(), kind, &err.to_string(), &body);
                let published = self.notifier.notify(&notification).await;
                settle(published, acker, Settle::Ack).await?;
                return Ok(DispatchOutcome::Poison);
            }
        };

        let request_type = request.request_type().clone();
        info!(
            target: "agent::dispatch",
            agent = %self.kind,
            request_id = %request.request_id,
            request_type = %request_type,
            redelivered,
            "Processing request"
        );

        let Some(handler) = self.registry.handler(&request_type) else {
            warn!(
                target: "agent::dispatch",
                request_id = %request.request_id,
                request_type = %request_type,
                "Unknown request type"
            );
            let response = ResponseEnvelope::error(
                request.request_id.clone(),
                format!("Unknown request type: {request_type}"),
            );
            let notification =
                SupervisorNotification::unknown_type(self.source(), request_context(&request, &body));
            let published = async {
                self.respond(&response, &properties).await?;
                self.notifier.notify(&notification).await
            }
            .await;
            settle(published, acker, Settle::Ack).await?;
            return Ok(DispatchOutcome::UnknownType);
        };

        match handler.handle(&request).await {
            Ok(outcome) => {
                let escalated = outcome.escalation.is_some();
                let published = async {
                    self.respond(&outcome.response, &properties).await?;
                    if let Some(reason) = &outcome.escalation {
                        info!(
                            target: "agent::dispatch",
                            request_id = %request.request_id,
                            escalation = %reason,
                            "Escalating request"
                        );
                        let notification = SupervisorNotification::escalation(
                            self.source(),
                            request_context(&request, &body),
                            reason.clone(),
                        );
                        self.notifier.notify(&notification).await?;
                    }
                    Ok(())
                }
                .await;
                settle(published, acker, Settle::Ack).await?;
                debug!(
                    target: "agent::dispatch",
                    request_id = %request.request_id,
                    status = %outcome.response.status,
                    "Request completed"
                );
                Ok(if escalated {
                    DispatchOutcome::Escalated
                } else {
                    DispatchOutcome::Handled
                })
            }
            Err(err) => {
                error!(
                    target: "agent::dispatch",
                    request_id = %request.request_id,
                    request_type = %request_type,
                    error = %err,
                    "Handler failed"
                );
                let notification =
                    SupervisorNotification::processing_error(self.source(), &err.to_string(), &body);
                let published = self.notifier.notify(&notification).await;
                settle(published, acker, Settle::Discard).await?;
                Ok(DispatchOutcome::HandlerFailed)
            }
        }
    }

    /// Publishes `response` to the request's reply queue, or to this agent's
    /// responses queue when the request named none.
    async fn respond(
        &self,
        response: &ResponseEnvelope,
        incoming: &MessageProperties,
    ) -> Result<(), PublishError> {
        let own_queue = self.kind.responses_queue();
        let queue = incoming
            .reply_to
            .clone()
            .unwrap_or_else(|| own_queue.clone());
        if queue != own_queue {
            self.channel.declare(&queue, true).await?;
        }
        publish_envelope(
            &self.channel,
            &queue,
            response,
            MessageProperties::reply_to_incoming(incoming),
        )
        .await
    }
}

/// Final settlement for a delivery whose outcome is known.
#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Discard,
}

/// Settles the delivery once its side effects are published. If publishing
/// failed, the delivery goes back on the queue and the publish error is
/// returned instead.
async fn settle(
    published: Result<(), PublishError>,
    acker: Acker,
    on_success: Settle,
) -> Result<(), RuntimeError> {
    if let Err(err) = published {
        error!(target: "agent::dispatch", error = %err, "Publish failed, requeueing delivery");
        if let Err(requeue_err) = acker.reject(true).await {
            warn!(target: "agent::dispatch", error = %requeue_err, "Requeue failed");
        }
        return Err(err.into());
    }

    let settled = match on_success {
        Settle::Ack => acker.ack().await,
        Settle::Discard => acker.reject(false).await,
    };
    match settled {
        Ok(()) => Ok(()),
        // The broker already gave the message to someone else; nothing to undo.
        Err(err @ ChannelError::UnknownDelivery { .. }) => {
            warn!(target: "agent::dispatch", error = %err, "Delivery settled too late");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn request_context(request: &RequestEnvelope, body: &[u8]) -> Value {
    request
        .to_value()
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{ChannelError, MessageChannel, MessageProperties, PublishError, publish_envelope};
use crate::envelope::{Envelope, SUPERVISOR_QUEUE, SupervisorNotification};

/// Publishes notifications on the shared supervisor queue.
#[derive(Clone)]
pub struct SupervisorNotifier {
    channel: Arc<dyn MessageChannel>,
}

impl SupervisorNotifier {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }

    pub async fn notify(&self, notification: &SupervisorNotification) -> Result<(), PublishError> {
        publish_envelope(
            &self.channel,
            SUPERVISOR_QUEUE,
            notification,
            MessageProperties::persistent(),
        )
        .await?;
        info!(
            target: "supervisor",
            source = %notification.source,
            error = notification.error.as_deref(),
            escalation = notification.escalation.as_deref(),
            "Supervisor notified"
        );
        Ok(())
    }
}

/// Consumes `supervisor_notifications` until `shutdown` fires or the channel
/// closes, handing each decoded notification to `sink` before acknowledging
/// it. Undecodable notifications are logged and acknowledged. Returns the
/// number of notifications delivered to `sink`.
pub async fn drain_notifications<F>(
    channel: Arc<dyn MessageChannel>,
    shutdown: CancellationToken,
    mut sink: F,
) -> Result<u64, ChannelError>
where
    F: FnMut(SupervisorNotification) + Send,
{
    channel.declare(SUPERVISOR_QUEUE, true).await?;
    let mut consumer = channel.consume(SUPERVISOR_QUEUE).await?;
    let mut drained = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = consumer.next() => next,
        };
        let Some(delivery) = next else {
            break;
        };
        let delivery = delivery?;

        match SupervisorNotification::decode(&delivery.body) {
            Ok(notification) => {
                if let Some(reason) = &notification.escalation {
                    warn!(
                        target: "supervisor",
                        source = %notification.source,
                        escalation = %reason,
                        "Escalation received"
                    );
                } else {
                    warn!(
                        target: "supervisor",
                        source = %notification.source,
                        error = notification.error.as_deref().unwrap_or("unspecified"),
                        "Agent failure reported"
                    );
                }
                sink(notification);
                drained += 1;
            }
            Err(err) => {
                warn!(target: "supervisor", error = %err, "Dropping undecodable notification");
            }
        }
        delivery.acker.ack().await?;
    }

    Ok(drained)
}

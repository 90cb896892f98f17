use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{AgentRuntime, HandlerRegistry, RunSummary, RuntimeError};
use crate::channel::{BrokerConnector, ChannelError};
use crate::context::ServiceContext;
use crate::envelope::AgentKind;
use crate::retry::RetryPolicy;

/// What an agent does when the broker stays down through every retry.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StartupPolicy {
    /// Return the connection error.
    #[default]
    FailFast,
    /// Stay alive, accept nothing, and log a heartbeat until shut down.
    Passive,
}

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub retry: RetryPolicy,
    pub policy: StartupPolicy,
    pub heartbeat: Duration,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            policy: StartupPolicy::FailFast,
            heartbeat: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Connected, consumed, then stopped.
    Stopped(RunSummary),
    /// Never connected; ran passively until shutdown.
    Passive,
}

/// Connects under the retry policy, then runs one agent until `shutdown`.
pub async fn launch_agent(
    kind: AgentKind,
    connector: &dyn BrokerConnector,
    registry: Arc<HandlerRegistry>,
    options: &StartupOptions,
    shutdown: CancellationToken,
) -> Result<AgentExit, RuntimeError> {
    let context = match ServiceContext::connect(connector, &options.retry, shutdown.child_token()).await
    {
        Ok(context) => context,
        Err(err @ ChannelError::Unavailable { .. }) => {
            return match options.policy {
                StartupPolicy::FailFast => {
                    error!(target: "agent", agent = %kind, error = %err, "Broker unavailable, giving up");
                    Err(RuntimeError::Unavailable(err))
                }
                StartupPolicy::Passive => {
                    run_passive(kind, options.heartbeat, shutdown).await;
                    Ok(AgentExit::Passive)
                }
            };
        }
        Err(err) => return Err(err.into()),
    };

    let runtime = AgentRuntime::new(&context, kind, registry);
    runtime.declare_queues().await?;
    let summary = runtime.run(context.shutdown_token()).await;

    if let Err(err) = context.shutdown().await {
        warn!(target: "agent", agent = %kind, error = %err, "Error closing channel");
    }
    Ok(AgentExit::Stopped(summary?))
}

/// Degraded mode: no broker, no consumption, just a periodic heartbeat.
pub async fn run_passive(kind: AgentKind, heartbeat: Duration, shutdown: CancellationToken) {
    warn!(target: "agent", agent = %kind, "Broker unavailable, entering passive mode");
    let mut ticker = tokio::time::interval(heartbeat.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                info!(target: "agent", agent = %kind, "Passive: not consuming, broker unavailable");
            }
        }
    }
    info!(target: "agent", agent = %kind, "Passive agent stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        assert_eq!(StartupPolicy::Passive.to_string(), "passive");
        let parsed: StartupPolicy = serde_json::from_str("\"fail_fast\"").unwrap();
        assert_eq!(parsed, StartupPolicy::FailFast);
    }

    #[tokio::test(start_paused = true)]
    async fn passive_mode_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_passive(
            AgentKind::Billing,
            Duration::from_secs(60),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(!task.is_finished());
        shutdown.cancel();
        task.await.unwrap();
    }
}

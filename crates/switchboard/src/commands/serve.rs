use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use std::sync::Arc;
use switchboard_core::ServiceContext;
use switchboard_core::agent::AgentRuntime;
use switchboard_core::agents::registry_for;
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::envelope::AgentKind;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::gateway::run_gateway;
use super::supervisor::run_supervisor;
use super::{Command, shutdown_on_ctrl_c};

/// Everything on one broker connection: gateway, one runtime per agent kind
/// and the supervisor drain. The first component to fail stops the rest.
pub struct ServeCommand {
    pub bind: Option<String>,
    pub config: SwitchboardConfig,
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let connector = self.config.connector();
        info!(broker = %connector.describe(), "Starting all-in-one switchboard");
        let context = ServiceContext::connect(
            connector.as_ref(),
            &self.config.broker.retry,
            shutdown.clone(),
        )
        .await
        .wrap_err("Could not reach the broker")?;

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        for kind in AgentKind::all() {
            let runtime = AgentRuntime::new(
                &context,
                kind,
                Arc::new(registry_for(kind, self.config.agent.refund_threshold)),
            );
            runtime.declare_queues().await?;
            let token = context.shutdown_token();
            tasks.spawn(async move {
                let result = runtime.run(token).await.map(|summary| {
                    info!(agent = %kind, processed = summary.total(), "Agent finished");
                });
                (kind.source_name(), result.map_err(Into::into))
            });
        }

        tasks.spawn({
            let context = context.clone();
            async move {
                let result = run_supervisor(&context).await.map(|drained| {
                    info!(drained, "Supervisor finished");
                });
                ("supervisor".to_string(), result)
            }
        });

        tasks.spawn({
            let context = context.clone();
            let config = self.config.clone();
            let bind = self
                .bind
                .clone()
                .unwrap_or_else(|| self.config.gateway.bind.clone());
            async move {
                let result = run_gateway(&context, &config, &bind).await;
                ("gateway".to_string(), result)
            }
        });

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (component, result) = match joined {
                Ok(done) => done,
                Err(err) => ("task".to_string(), Err(eyre!("Component task panicked: {err}"))),
            };
            match result {
                Ok(()) => info!(%component, "Component stopped"),
                Err(err) => {
                    error!(%component, error = %err, "Component failed, stopping the rest");
                    shutdown.cancel();
                    failure.get_or_insert(err);
                }
            }
        }

        if let Err(err) = context.shutdown().await {
            warn!(error = %err, "Error closing broker channel");
        }
        failure.map_or(Ok(()), Err)
    }
}

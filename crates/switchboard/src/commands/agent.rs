use async_trait::async_trait;
use eyre::Result;
use std::sync::Arc;
use switchboard_core::agent::{AgentExit, StartupPolicy, launch_agent};
use switchboard_core::agents::registry_for;
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::envelope::AgentKind;
use tracing::info;

use super::{Command, shutdown_on_ctrl_c};

pub struct AgentCommand {
    pub kind: AgentKind,
    pub passive: bool,
    pub config: SwitchboardConfig,
}

#[async_trait]
impl Command for AgentCommand {
    async fn execute(&self) -> Result<()> {
        let connector = self.config.connector();
        let registry = Arc::new(registry_for(self.kind, self.config.agent.refund_threshold));
        let mut options = self.config.startup_options();
        if self.passive {
            options.policy = StartupPolicy::Passive;
        }

        info!(
            agent = %self.kind,
            broker = %connector.describe(),
            handlers = registry.len(),
            policy = %options.policy,
            "Starting agent"
        );

        let exit = launch_agent(
            self.kind,
            connector.as_ref(),
            registry,
            &options,
            shutdown_on_ctrl_c(),
        )
        .await?;

        match exit {
            AgentExit::Stopped(summary) => info!(
                agent = %self.kind,
                handled = summary.handled,
                escalated = summary.escalated,
                unknown_type = summary.unknown_type,
                handler_failed = summary.handler_failed,
                poison = summary.poison,
                "Agent stopped"
            ),
            AgentExit::Passive => info!(agent = %self.kind, "Passive agent stopped"),
        }
        Ok(())
    }
}

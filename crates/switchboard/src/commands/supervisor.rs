use async_trait::async_trait;
use eyre::{Result, WrapErr};
use switchboard_core::ServiceContext;
use switchboard_core::agent::drain_notifications;
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::envelope::SupervisorNotification;
use tracing::{debug, info, warn};

use super::{Command, shutdown_on_ctrl_c};

pub struct SupervisorCommand {
    pub config: SwitchboardConfig,
}

#[async_trait]
impl Command for SupervisorCommand {
    async fn execute(&self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let connector = self.config.connector();
        let context =
            ServiceContext::connect(connector.as_ref(), &self.config.broker.retry, shutdown)
                .await
                .wrap_err("Supervisor could not reach the broker")?;

        let drained = run_supervisor(&context).await;
        if let Err(err) = context.shutdown().await {
            warn!(error = %err, "Error closing broker channel");
        }
        info!(drained = drained?, "Supervisor stopped");
        Ok(())
    }
}

pub async fn run_supervisor(context: &ServiceContext) -> Result<u64> {
    info!("Draining supervisor notifications");
    let drained = drain_notifications(
        context.channel().clone(),
        context.shutdown_token(),
        log_notification,
    )
    .await?;
    Ok(drained)
}

fn log_notification(notification: SupervisorNotification) {
    match serde_json::to_string(&notification) {
        Ok(body) => debug!(target: "supervisor", %body, "Notification"),
        Err(err) => warn!(target: "supervisor", error = %err, "Notification could not be serialized"),
    }
}

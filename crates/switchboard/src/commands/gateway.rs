use async_trait::async_trait;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use switchboard_core::ServiceContext;
use switchboard_core::config::SwitchboardConfig;
use switchboard_core::gateway::{GatewayDispatcher, ResponseCollector};
use switchboard_http::AppState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Command, shutdown_on_ctrl_c};

pub struct GatewayCommand {
    pub bind: Option<String>,
    pub config: SwitchboardConfig,
}

#[async_trait]
impl Command for GatewayCommand {
    async fn execute(&self) -> Result<()> {
        let shutdown = shutdown_on_ctrl_c();
        let connector = self.config.connector();
        info!(broker = %connector.describe(), "Connecting gateway to broker");
        let context =
            ServiceContext::connect(connector.as_ref(), &self.config.broker.retry, shutdown.clone())
                .await
                .wrap_err("Gateway could not reach the broker")?;

        let bind = self.bind.as_deref().unwrap_or(&self.config.gateway.bind);
        let served = run_gateway(&context, &self.config, bind).await;
        if let Err(err) = context.shutdown().await {
            warn!(error = %err, "Error closing broker channel");
        }
        served
    }
}

/// Serves HTTP and, when enabled, collects agent responses until the
/// context's shutdown token fires.
pub async fn run_gateway(
    context: &ServiceContext,
    config: &SwitchboardConfig,
    bind: &str,
) -> Result<()> {
    let gateway = Arc::new(GatewayDispatcher::from_config(context, config).await?);
    let shutdown = context.shutdown_token();

    let collector = config.gateway.collect_responses.then(|| {
        let collector = ResponseCollector::new(context.channel().clone(), gateway.responses().clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move { collector.run(shutdown).await })
    });
    if collector.is_none() {
        info!("Response collection disabled; lookups will stay pending");
    }

    let listener = switchboard_http::bind(bind).await?;
    let served = switchboard_http::serve(listener, AppState::new(gateway), shutdown.clone()).await;

    stop_collector(collector, &shutdown).await;
    served?;
    Ok(())
}

async fn stop_collector(
    collector: Option<tokio::task::JoinHandle<Result<u64, switchboard_core::channel::ChannelError>>>,
    shutdown: &CancellationToken,
) {
    let Some(collector) = collector else {
        return;
    };
    shutdown.cancel();
    match collector.await {
        Ok(Ok(stored)) => info!(stored, "Response collector stopped"),
        Ok(Err(err)) => error!(error = %err, "Response collector failed"),
        Err(err) => error!(error = %err, "Response collector task panicked"),
    }
}

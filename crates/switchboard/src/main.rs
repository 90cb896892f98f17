use clap::Parser;
use eyre::Result;
use tracing::debug;

use switchboard::cli::config::{load_config, load_env};
use switchboard::cli::{Cli, Commands};
use switchboard::commands::{
    Command, agent::AgentCommand, gateway::GatewayCommand, serve::ServeCommand,
    supervisor::SupervisorCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Load .env before clap reads env-backed flags
    load_env()?;
    let cli = Cli::parse();

    switchboard::utils::tracing::init_tracing(&cli.log_level, cli.log_dir.as_deref())?;

    let config = load_config(&cli)?;
    debug!(?config, "Configuration loaded");

    let command: Box<dyn Command> = match cli.command {
        Commands::Agent { kind, passive } => Box::new(AgentCommand {
            kind,
            passive,
            config,
        }),
        Commands::Gateway { bind } => Box::new(GatewayCommand { bind, config }),
        Commands::Supervisor => Box::new(SupervisorCommand { config }),
        Commands::Serve { bind } => Box::new(ServeCommand { bind, config }),
    };

    command.execute().await
}

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchboard_core::envelope::AgentKind;

/// Routes customer-service requests to specialised agents and escalates what
/// they cannot settle.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file (TOML). Defaults to ~/.config/switchboard/config.toml when present
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also write logs to a file in this directory
    #[arg(long, global = true, env = "SWITCHBOARD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// SQLite broker database, overriding `[broker] path`
    #[arg(long, global = true, env = "SWITCHBOARD_BROKER_PATH")]
    pub broker_path: Option<PathBuf>,

    /// SQLite session database, overriding `[sessions] path`
    #[arg(long, global = true, env = "SWITCHBOARD_SESSIONS_PATH", hide = true)]
    pub sessions_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run one agent until Ctrl+C
    Agent {
        /// Which agent: billing or international
        kind: AgentKind,

        /// Stay up without a broker instead of exiting when it is unreachable
        #[arg(long)]
        passive: bool,
    },
    /// Run the HTTP gateway and its response collector
    Gateway {
        /// Listen address, overriding `[gateway] bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Drain supervisor notifications, logging each one
    Supervisor,
    /// Gateway, both agents and the supervisor drain in one process
    Serve {
        /// Listen address, overriding `[gateway] bind`
        #[arg(long)]
        bind: Option<String>,
    },
}

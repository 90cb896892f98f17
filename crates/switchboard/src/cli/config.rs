use dotenvy::dotenv;
use eyre::{Result, WrapErr};
use switchboard_core::config::SwitchboardConfig;

use super::Cli;

pub fn load_env() -> Result<()> {
    dotenv().ok();
    Ok(())
}

/// Config file plus command-line overrides.
pub fn load_config(cli: &Cli) -> Result<SwitchboardConfig> {
    let mut config = SwitchboardConfig::load(cli.config.as_deref())
        .wrap_err("Failed to load configuration")?;
    if let Some(path) = &cli.broker_path {
        config.broker.path.clone_from(path);
    }
    if let Some(path) = &cli.sessions_path {
        config.sessions.path.clone_from(path);
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\npath = \"/var/lib/switchboard/broker.db\"").unwrap();
        let config_path = file.path().to_string_lossy().to_string();

        let cli = Cli::parse_from(["switchboard", "--config", &config_path, "supervisor"]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.broker.path, PathBuf::from("/var/lib/switchboard/broker.db"));

        let cli = Cli::parse_from([
            "switchboard",
            "--config",
            &config_path,
            "--broker-path",
            "/tmp/other.db",
            "supervisor",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.broker.path, PathBuf::from("/tmp/other.db"));
    }
}

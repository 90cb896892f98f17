use chrono::Local;
use eyre::{Result, WrapErr};
use std::path::Path;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
/// With `log_dir`, events also go to a timestamp-named file in that directory.
pub fn init_tracing(default_level: &str, log_dir: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .wrap_err_with(|| format!("Invalid log level '{default_level}'"))?;

    let stderr_layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_target(true);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .wrap_err_with(|| format!("Failed to create log directory {}", dir.display()))?;
            let file_name = format!("switchboard_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
            let file_appender = rolling::never(dir, &file_name);

            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(
                    fmt::Layer::new()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_span_events(FmtSpan::CLOSE)
                        .with_file(true)
                        .with_line_number(true),
                )
                .with(filter)
                .try_init()
                .wrap_err("Failed to set global default subscriber")?;

            tracing::debug!(
                target: "switchboard::utils::tracing",
                path = %dir.join(&file_name).display(),
                "Tracing initialized with file output"
            );
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .try_init()
                .wrap_err("Failed to set global default subscriber")?;
        }
    }

    Ok(())
}

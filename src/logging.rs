use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
/// Without a file, logs go to stderr so stdout stays clean for output.
pub fn init_logging(level: &str, file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    match file {
        Some(path) => {
            let log_file = std::sync::Arc::new(
                std::fs::File::create(path)
                    .with_context(|| format!("create log file {}", path.display()))?,
            );
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true)
                .with_writer(log_file)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    info!("logging initialized");
    Ok(())
}

use anyhow::Result;
use std::fs::{self, File};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogOutput, LoggingConfig};

pub fn setup_global_logging(config: &LoggingConfig) -> Result<()> {
    // Format: info,troupe=debug
    let filter = format!("{},troupe={}", config.level, config.level);

    match config.output {
        LogOutput::File => {
            let log_path = config
                .file_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("logging.file_path is required for file output"))?;

            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let file = File::create(&log_path)?;
            let file_writer = std::sync::Mutex::new(file);

            let file_layer = fmt::layer()
                .with_writer(file_writer)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true)
                .with_ansi(false)
                .with_filter(EnvFilter::builder().parse(&filter)?);

            tracing_subscriber::registry()
                .with(file_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
        LogOutput::Stdout => {
            let stdout_layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(true)
                .with_ansi(true)
                .with_filter(EnvFilter::builder().parse(&filter)?);

            tracing_subscriber::registry()
                .with(stdout_layer)
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}

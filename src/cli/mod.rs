//! CLI module for handlepool
//!
//! Drives a TCP-backed connection pool from the command line, mostly useful
//! for checking endpoints and watching the pool's reuse and eviction behavior.
//!
//! # Usage
//!
//! ```bash
//! # Dial several endpoints at once
//! handlepool probe db-1:5432 db-2:5432 cache:6379
//!
//! # Borrow/release every 2s for a minute, with a 5s linger time
//! HANDLEPOOL_LINGER_SECS=5 handlepool soak cache:6379 --duration-secs 60 --interval-ms 2000
//!
//! # Show the configuration that would be used
//! handlepool --config pool.yaml config
//! ```

pub mod args;
pub mod commands;

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, info};

use crate::config;
use args::{Cli, Commands};

/// Run the CLI application
pub async fn run(cli: Cli) -> Result<()> {
    // Validate arguments
    cli.validate().context("Invalid arguments")?;

    debug!("CLI arguments: {:?}", cli);

    let config = config::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Probe { endpoints } => {
            commands::cmd_probe(&config, &endpoints, cli.format).await?;
        }

        Commands::Soak {
            endpoint,
            duration_secs,
            interval_ms,
            hold,
        } => {
            commands::cmd_soak(
                &config,
                &endpoint,
                Duration::from_secs(duration_secs),
                Duration::from_millis(interval_ms),
                hold,
                cli.format,
            )
            .await?;
        }

        Commands::Config => {
            commands::cmd_config(&config, cli.format)?;
        }
    }

    info!("Command completed successfully");
    Ok(())
}

/// Initialize logging: `RUST_LOG` wins, otherwise the `--log-level` flag
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

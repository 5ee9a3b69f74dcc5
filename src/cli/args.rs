use clap::{Parser, Subcommand};

use crate::dial::tcp::split_endpoint;

/// handlepool - shared, reference-counted connections with tiered dial retry
#[derive(Parser, Debug)]
#[command(name = "handlepool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (YAML). Environment variables are used when omitted.
    #[arg(long, global = true, env = "HANDLEPOOL_CONFIG")]
    pub config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Output format (text, json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dial endpoints through one pool and report each outcome
    Probe {
        /// Endpoints as host:port
        #[arg(value_name = "ENDPOINT", required = true)]
        endpoints: Vec<String>,
    },

    /// Repeatedly borrow and release one endpoint to watch reuse and eviction
    Soak {
        /// Endpoint as host:port
        #[arg(value_name = "ENDPOINT")]
        endpoint: String,

        /// How long to run
        #[arg(long, default_value = "30")]
        duration_secs: u64,

        /// Pause between borrows
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Keep the borrow during the pause instead of releasing first
        #[arg(long)]
        hold: bool,
    },

    /// Print the effective configuration
    Config,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Validate arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Probe { endpoints } => {
                for endpoint in endpoints {
                    validate_endpoint(endpoint)?;
                }
            }
            Commands::Soak {
                endpoint,
                duration_secs,
                interval_ms,
                ..
            } => {
                validate_endpoint(endpoint)?;
                if *duration_secs == 0 {
                    anyhow::bail!("Duration must be greater than 0");
                }
                if *interval_ms == 0 {
                    anyhow::bail!("Interval must be greater than 0");
                }
            }
            Commands::Config => {}
        }

        Ok(())
    }
}

/// Check that an endpoint looks like `host:port`, the way the TCP dialer reads it
pub fn validate_endpoint(endpoint: &str) -> anyhow::Result<()> {
    split_endpoint(endpoint.trim())
        .map_err(|e| anyhow::anyhow!("Invalid endpoint {:?}: {}. Expected: host:port", endpoint, e))?;
    Ok(())
}

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cli::args::OutputFormat;
use crate::config::Config;
use crate::dial::TcpDialer;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};

/// Build a TCP-backed pool from configuration
pub fn build_pool(config: &Config) -> Result<ConnectionPool<TcpDialer>> {
    let dialer = TcpDialer::new(config.dialer_config());
    let factory = Arc::new(ConnectionFactory::new(dialer, config.factory_config()));
    ConnectionPool::new(factory, config.pool_config()).context("Failed to create connection pool")
}

/// Outcome of dialing one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub endpoint: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProbeReport<'a> {
    outcomes: &'a [ProbeOutcome],
    stats: &'a PoolStats,
}

/// Dial every endpoint concurrently through one pool
pub async fn cmd_probe(config: &Config, endpoints: &[String], format: OutputFormat) -> Result<()> {
    let pool = Arc::new(build_pool(config)?);
    let mut tasks = JoinSet::new();

    for (idx, endpoint) in endpoints.iter().enumerate() {
        let pool = Arc::clone(&pool);
        let endpoint = endpoint.trim().to_string();

        tasks.spawn(async move {
            let start = Instant::now();
            let result = pool.get(&endpoint).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(handle) => {
                    let peer = handle.connection().peer_addr().ok().map(|addr| addr.to_string());
                    if let Err(e) = pool.release(&handle) {
                        warn!(endpoint = %endpoint, error = %e, "Release failed");
                    }
                    ProbeOutcome {
                        endpoint,
                        connected: true,
                        latency_ms,
                        peer,
                        error: None,
                    }
                }
                Err(e) => ProbeOutcome {
                    endpoint,
                    connected: false,
                    latency_ms,
                    peer: None,
                    error: Some(e.to_string()),
                },
            };
            (idx, outcome)
        });
    }

    let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; endpoints.len()];
    while let Some(joined) = tasks.join_next().await {
        let (idx, outcome) = joined.context("Probe task failed")?;
        outcomes[idx] = Some(outcome);
    }
    let outcomes: Vec<ProbeOutcome> = outcomes.into_iter().flatten().collect();

    let stats = pool.stats();
    pool.close().await;

    match format {
        OutputFormat::Text => {
            for outcome in &outcomes {
                if outcome.connected {
                    println!(
                        "OK    {:<30} {:>6}ms  peer={}",
                        outcome.endpoint,
                        outcome.latency_ms,
                        outcome.peer.as_deref().unwrap_or("-")
                    );
                } else {
                    println!(
                        "FAIL  {:<30} {:>6}ms  {}",
                        outcome.endpoint,
                        outcome.latency_ms,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            print_stats_text(&stats);
        }
        OutputFormat::Json => {
            let report = ProbeReport {
                outcomes: &outcomes,
                stats: &stats,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    let failed = outcomes.iter().filter(|o| !o.connected).count();
    if failed > 0 {
        anyhow::bail!("{} of {} endpoint(s) unreachable", failed, outcomes.len());
    }

    Ok(())
}

/// Summary of a soak run
#[derive(Debug, Default, Serialize)]
pub struct SoakSummary {
    pub endpoint: String,
    pub rounds: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stats: PoolStats,
}

/// Borrow and release one endpoint on an interval until the duration elapses
pub async fn cmd_soak(
    config: &Config,
    endpoint: &str,
    duration: Duration,
    interval: Duration,
    hold: bool,
    format: OutputFormat,
) -> Result<()> {
    let pool = build_pool(config)?;
    let endpoint = endpoint.trim();
    let deadline = Instant::now() + duration;

    info!(
        endpoint = %endpoint,
        duration_secs = duration.as_secs(),
        interval_ms = interval.as_millis() as u64,
        hold = hold,
        linger_secs = pool.linger().as_secs(),
        "Starting soak"
    );

    let mut summary = SoakSummary {
        endpoint: endpoint.to_string(),
        ..Default::default()
    };

    while Instant::now() < deadline {
        summary.rounds += 1;

        match pool.get(endpoint).await {
            Ok(handle) => {
                summary.succeeded += 1;
                debug!(round = summary.rounds, ref_count = handle.ref_count(), "Borrowed");

                if hold {
                    tokio::time::sleep(interval).await;
                    pool.release(&handle)?;
                } else {
                    pool.release(&handle)?;
                    tokio::time::sleep(interval).await;
                }
            }
            Err(e) => {
                summary.failed += 1;
                warn!(round = summary.rounds, error = %e, "Borrow failed");
                tokio::time::sleep(interval).await;
            }
        }
    }

    summary.stats = pool.stats();
    pool.close().await;

    match format {
        OutputFormat::Text => {
            println!(
                "{}: {} rounds, {} ok, {} failed",
                summary.endpoint, summary.rounds, summary.succeeded, summary.failed
            );
            print_stats_text(&summary.stats);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

/// Print the effective configuration
pub fn cmd_config(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", serde_yaml::to_string(config)?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
    }
    Ok(())
}

fn print_stats_text(stats: &PoolStats) {
    println!(
        "pool: created={} reused={} failed={} evicted={} invalidated={} live={} borrows={}",
        stats.total_created,
        stats.total_reused,
        stats.failed_attempts,
        stats.evicted_idle,
        stats.invalidated,
        stats.live_handles,
        stats.outstanding_borrows
    );
}

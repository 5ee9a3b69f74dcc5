//! Connection factory with tiered retry
//!
//! The factory wraps a [`Dial`] implementation and applies one of two retry
//! tiers to it. The first time an endpoint id is ever dialed through a given
//! factory it gets the patient `initial` tier; every later dial of that id
//! uses the short `subsequent` tier so a failing, previously good endpoint is
//! surfaced quickly.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{DialError, FactoryError};

/// The transport-specific operation that opens one connection
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn dial(&self, endpoint_id: &str) -> Result<Self::Connection, DialError>;
}

/// Retry settings for both tiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Retries after the first failed attempt on a never-seen endpoint
    pub initial_retries: u32,

    /// Wait between attempts on a never-seen endpoint
    pub initial_grace: Duration,

    /// Retries after the first failed attempt on a seen endpoint
    pub subsequent_retries: u32,

    /// Wait between attempts on a seen endpoint
    pub subsequent_grace: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            initial_retries: 4,
            initial_grace: Duration::from_millis(5000),
            subsequent_retries: 3,
            subsequent_grace: Duration::from_millis(500),
        }
    }
}

/// Which retry tier applies to a dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTier {
    Initial,
    Subsequent,
}

impl RetryTier {
    pub fn name(&self) -> &str {
        match self {
            RetryTier::Initial => "initial",
            RetryTier::Subsequent => "subsequent",
        }
    }
}

impl FactoryConfig {
    /// `(retries, grace)` for a tier
    pub fn tier(&self, tier: RetryTier) -> (u32, Duration) {
        match tier {
            RetryTier::Initial => (self.initial_retries, self.initial_grace),
            RetryTier::Subsequent => (self.subsequent_retries, self.subsequent_grace),
        }
    }
}

/// Produces connections for endpoint ids using a dialer and a retry policy
pub struct ConnectionFactory<D> {
    dialer: D,
    config: FactoryConfig,
    /// Endpoint ids dialed at least once. Only ever grows.
    seen: Mutex<HashSet<String>>,
    /// Fired by [`ConnectionFactory::shutdown`]; aborts every grace wait
    shutdown: CancellationToken,
}

impl<D: Dial> ConnectionFactory<D> {
    pub fn new(dialer: D, config: FactoryConfig) -> Self {
        Self {
            dialer,
            config,
            seen: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Returns `true` exactly once per endpoint id and records it as seen.
    pub fn is_first_contact(&self, endpoint_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if seen.contains(endpoint_id) {
            return false;
        }
        seen.insert(endpoint_id.to_string())
    }

    /// Whether `endpoint_id` has been dialed through this factory before
    pub fn has_seen(&self, endpoint_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(endpoint_id)
    }

    /// Cancel all current and future grace waits
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Dial `endpoint_id`, retrying per the applicable tier
    pub async fn create_connection(&self, endpoint_id: &str) -> Result<D::Connection, FactoryError> {
        self.create_connection_with_cancel(endpoint_id, &self.shutdown).await
    }

    /// Like [`ConnectionFactory::create_connection`], but `cancel` can also
    /// interrupt a grace wait.
    pub async fn create_connection_with_cancel(
        &self,
        endpoint_id: &str,
        cancel: &CancellationToken,
    ) -> Result<D::Connection, FactoryError> {
        let tier = if self.is_first_contact(endpoint_id) {
            RetryTier::Initial
        } else {
            RetryTier::Subsequent
        };
        let (retries, grace) = self.config.tier(tier);
        let max_attempts = retries.saturating_add(1);

        debug!(
            endpoint_id = %endpoint_id,
            tier = tier.name(),
            max_attempts = max_attempts,
            "Creating new connection"
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let err = match self.dialer.dial(endpoint_id).await {
                Ok(connection) => {
                    info!(
                        endpoint_id = %endpoint_id,
                        attempt = attempt,
                        tier = tier.name(),
                        "Connected"
                    );
                    return Ok(connection);
                }
                Err(err) => err,
            };

            if attempt >= max_attempts {
                warn!(
                    endpoint_id = %endpoint_id,
                    attempts = attempt,
                    error = %err,
                    "Giving up on connection"
                );
                return Err(FactoryError::Exhausted {
                    endpoint_id: endpoint_id.to_string(),
                    attempts: attempt,
                    last: err,
                });
            }

            warn!(
                endpoint_id = %endpoint_id,
                attempt = attempt,
                remaining = max_attempts - attempt,
                grace_ms = grace.as_millis() as u64,
                error = %err,
                "Dial failed, retrying"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(self.cancelled(endpoint_id, attempt));
                }
                () = self.shutdown.cancelled() => {
                    return Err(self.cancelled(endpoint_id, attempt));
                }
                () = tokio::time::sleep(grace) => {}
            }
        }
    }

    fn cancelled(&self, endpoint_id: &str, attempts: u32) -> FactoryError {
        info!(endpoint_id = %endpoint_id, attempts = attempts, "Connection attempt cancelled");
        FactoryError::Cancelled {
            endpoint_id: endpoint_id.to_string(),
            attempts,
        }
    }
}

impl<D> std::fmt::Debug for ConnectionFactory<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

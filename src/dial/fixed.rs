//! In-process dialer returning a fixed connection value

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::pool::{Dial, DialError};

#[derive(Debug, Default, Clone, Copy)]
struct Script {
    /// Number of upcoming dials to fail
    fail_next: u32,
    fail_always: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    attempts: u64,
    connected: u64,
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, Script>,
    counters: HashMap<String, Counters>,
}

/// Dialer that clones a fixed connection for every successful dial.
///
/// Failures can be scripted per endpoint id, and every attempt is counted,
/// which makes it the dialer of choice for exercising pool behavior.
#[derive(Debug)]
pub struct FixedDialer<C> {
    connection: C,
    latency: Duration,
    state: Mutex<State>,
}

impl<C: Clone> FixedDialer<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Delay every dial by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` dials of `endpoint_id`
    pub fn fail_next(&self, endpoint_id: &str, count: u32) {
        self.state()
            .scripts
            .entry(endpoint_id.to_string())
            .or_default()
            .fail_next = count;
    }

    /// Fail every dial of `endpoint_id` until [`FixedDialer::recover`]
    pub fn fail_always(&self, endpoint_id: &str) {
        self.state()
            .scripts
            .entry(endpoint_id.to_string())
            .or_default()
            .fail_always = true;
    }

    /// Clear any scripted failures for `endpoint_id`
    pub fn recover(&self, endpoint_id: &str) {
        self.state().scripts.remove(endpoint_id);
    }

    /// Dial attempts made for `endpoint_id`, successful or not
    pub fn attempts(&self, endpoint_id: &str) -> u64 {
        self.state()
            .counters
            .get(endpoint_id)
            .map(|c| c.attempts)
            .unwrap_or(0)
    }

    /// Successful dials for `endpoint_id`
    pub fn connected(&self, endpoint_id: &str) -> u64 {
        self.state()
            .counters
            .get(endpoint_id)
            .map(|c| c.connected)
            .unwrap_or(0)
    }

    fn record_attempt(&self, endpoint_id: &str) -> Result<(), DialError> {
        let mut state = self.state();
        state.counters.entry(endpoint_id.to_string()).or_default().attempts += 1;

        let fail = match state.scripts.get_mut(endpoint_id) {
            Some(script) if script.fail_always => true,
            Some(script) if script.fail_next > 0 => {
                script.fail_next -= 1;
                true
            }
            _ => false,
        };

        if fail {
            return Err(DialError::Refused(format!("scripted failure for {}", endpoint_id)));
        }

        state.counters.entry(endpoint_id.to_string()).or_default().connected += 1;
        Ok(())
    }
}

#[async_trait]
impl<C> Dial for FixedDialer<C>
where
    C: Clone + Send + Sync + 'static,
{
    type Connection = C;

    async fn dial(&self, endpoint_id: &str) -> Result<C, DialError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.record_attempt(endpoint_id)?;
        Ok(self.connection.clone())
    }
}

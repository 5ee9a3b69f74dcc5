//! Connection pool keyed by endpoint id
//!
//! This module provides the registry that hands out shared, reference-counted
//! connection handles:
//! - One handle per endpoint id, shared by every caller until it goes bad or idle
//! - Lazy creation through a [`ConnectionFactory`] and its retry policy
//! - Per-id creation gates so concurrent misses dial only once
//! - Background eviction of unreferenced handles idle past the linger time
//! - Immediate invalidation of handles reported as broken

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::{FactoryError, PoolError};
use super::factory::{ConnectionFactory, Dial};
use super::handle::ConnectionHandle;
use super::reaper::Reaper;

/// Configuration for connection pool behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long an unreferenced handle may sit idle before it is evicted.
    /// Also the reaper's scan period.
    pub linger: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn with_linger_secs(secs: u64) -> Self {
        Self {
            linger: Duration::from_secs(secs),
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.linger.is_zero() {
            return Err(PoolError::InvalidConfig("linger must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Statistics for a connection pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Handles created from successful dials
    pub total_created: u64,

    /// `get` calls served by an existing handle
    pub total_reused: u64,

    /// `get` calls whose dial sequence failed
    pub failed_attempts: u64,

    /// Handles dropped by the reaper
    pub evicted_idle: u64,

    /// Handles dropped by error reports
    pub invalidated: u64,

    /// Handles currently registered
    pub live_handles: usize,

    /// Sum of reference counts over registered handles
    pub outstanding_borrows: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_created: AtomicU64,
    total_reused: AtomicU64,
    failed_attempts: AtomicU64,
    evicted_idle: AtomicU64,
    invalidated: AtomicU64,
}

/// How an in-flight creation ended, as seen by the callers queued behind it
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Created,
    Failed(Arc<FactoryError>),
    Closed,
}

/// Published by whichever caller is dialing a missing id; others subscribe to it
type CreationGate = Arc<watch::Sender<Outcome>>;

/// What a `get` does after looking in the registry
enum Turn {
    Wait(watch::Receiver<Outcome>),
    Dial(CreationGate),
}

/// The dialing caller's claim on a creation gate.
///
/// Unregisters the gate when dropped, so a `get` cancelled mid-dial closes
/// the channel and its waiters go back to the registry.
struct Creation<'a, C> {
    shared: &'a Shared<C>,
    endpoint_id: &'a str,
    gate: CreationGate,
}

impl<C> Creation<'_, C> {
    /// Unregister the gate, then tell every waiter how the dial went
    fn finish(self, outcome: Outcome) {
        let gate = Arc::clone(&self.gate);
        drop(self);
        gate.send_replace(outcome);
    }
}

impl<C> Drop for Creation<'_, C> {
    fn drop(&mut self) {
        let mut registry = self.shared.lock();
        let is_current = registry
            .creating
            .get(self.endpoint_id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.gate));
        if is_current {
            registry.creating.remove(self.endpoint_id);
        }
    }
}

struct Registry<C> {
    handles: HashMap<String, Arc<ConnectionHandle<C>>>,
    creating: HashMap<String, CreationGate>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            handles: HashMap::new(),
            creating: HashMap::new(),
        }
    }
}

/// State shared between the pool and its reaper task
pub(crate) struct Shared<C> {
    registry: Mutex<Registry<C>>,
    closed: AtomicBool,
    linger: Duration,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Registry<C>> {
        // No registry mutation can panic halfway, so recover from poisoning
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop every handle that is unreferenced and idle past the linger time.
    ///
    /// Does not block: if the registry is held elsewhere the scan is skipped
    /// with [`PoolError::Busy`].
    pub(crate) fn evict_idle(&self) -> Result<usize, PoolError> {
        let mut registry = match self.registry.try_lock() {
            Ok(registry) => registry,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(PoolError::Busy),
        };

        let now = self.clock.now();
        let before = registry.handles.len();

        registry.handles.retain(|endpoint_id, handle| {
            if handle.is_evictable(now, self.linger) {
                debug!(
                    endpoint_id = %endpoint_id,
                    idle_ms = handle.idle_for(now).as_millis() as u64,
                    "Evicting idle connection"
                );
                false
            } else {
                true
            }
        });

        let evicted = before - registry.handles.len();
        if evicted > 0 {
            self.counters
                .evicted_idle
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(
                evicted = evicted,
                remaining = registry.handles.len(),
                "Cleaned up idle connections"
            );
        }

        Ok(evicted)
    }
}

/// Shared registry of reference-counted connections, one per endpoint id
pub struct ConnectionPool<D: Dial> {
    factory: Arc<ConnectionFactory<D>>,
    shared: Arc<Shared<D::Connection>>,
    reaper: Reaper,
    /// Cancelled on close; interrupts grace waits of in-flight dials
    shutdown: CancellationToken,
}

impl<D: Dial> ConnectionPool<D> {
    /// Create a pool over a shared factory
    pub fn new(factory: Arc<ConnectionFactory<D>>, config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_clock(factory, config, Arc::new(SystemClock))
    }

    /// Create a pool whose idle bookkeeping uses `clock`
    pub fn with_clock(
        factory: Arc<ConnectionFactory<D>>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PoolError> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let reaper = Reaper::new(config.linger, shutdown.child_token());

        Ok(Self {
            factory,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                closed: AtomicBool::new(false),
                linger: config.linger,
                clock,
                counters: Counters::default(),
            }),
            reaper,
            shutdown,
        })
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory<D>> {
        &self.factory
    }

    pub fn linger(&self) -> Duration {
        self.shared.linger
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.shared.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    /// Borrow the connection for `endpoint_id`, dialing it if needed.
    ///
    /// The returned handle has already been borrowed once on the caller's
    /// behalf; give it back with [`ConnectionPool::release`]. Concurrent
    /// misses on one id share a single dial and all see its outcome.
    pub async fn get(&self, endpoint_id: &str) -> Result<Arc<ConnectionHandle<D::Connection>>, PoolError> {
        self.ensure_open()?;
        self.reaper.ensure_started(&self.shared);

        if endpoint_id.is_empty() {
            return Err(PoolError::InvalidEndpointId);
        }

        loop {
            let turn = {
                let mut registry = self.shared.lock();
                self.ensure_open()?;
                if let Some(handle) = self.reuse(&registry, endpoint_id) {
                    return Ok(handle);
                }

                if let Some(gate) = registry.creating.get(endpoint_id) {
                    Turn::Wait(gate.subscribe())
                } else {
                    let gate: CreationGate = Arc::new(watch::channel(Outcome::Pending).0);
                    registry
                        .creating
                        .insert(endpoint_id.to_string(), Arc::clone(&gate));
                    Turn::Dial(gate)
                }
            };

            let mut waiting = match turn {
                Turn::Wait(waiting) => waiting,
                Turn::Dial(gate) => {
                    let creation = Creation {
                        shared: &self.shared,
                        endpoint_id,
                        gate,
                    };
                    return self.create(creation).await;
                }
            };

            let outcome = waiting
                .wait_for(|outcome| !matches!(outcome, Outcome::Pending))
                .await
                .map(|outcome| outcome.clone());

            match outcome {
                Ok(Outcome::Failed(e)) => return Err(PoolError::Connect(e)),
                Ok(Outcome::Closed) => return Err(PoolError::Closed),
                // Registered, or the dialing caller was cancelled: look again
                Ok(Outcome::Created | Outcome::Pending) | Err(_) => {
                    debug!(endpoint_id = %endpoint_id, "Creation finished, rechecking registry");
                }
            }
        }
    }

    /// Look up and borrow under the registry lock, so the reaper can never
    /// evict between the lookup and the increment.
    fn reuse(
        &self,
        registry: &Registry<D::Connection>,
        endpoint_id: &str,
    ) -> Option<Arc<ConnectionHandle<D::Connection>>> {
        let handle = registry.handles.get(endpoint_id)?;
        handle.borrow();
        self.shared.counters.total_reused.fetch_add(1, Ordering::Relaxed);
        debug!(
            endpoint_id = %endpoint_id,
            ref_count = handle.ref_count(),
            "Reusing connection"
        );
        Some(Arc::clone(handle))
    }

    async fn create(
        &self,
        creation: Creation<'_, D::Connection>,
    ) -> Result<Arc<ConnectionHandle<D::Connection>>, PoolError> {
        let endpoint_id = creation.endpoint_id;

        let connection = match self
            .factory
            .create_connection_with_cancel(endpoint_id, &self.shutdown)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.shared.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                let e = Arc::new(e);
                creation.finish(Outcome::Failed(Arc::clone(&e)));
                return Err(PoolError::Connect(e));
            }
        };

        let handle = Arc::new(ConnectionHandle::new(
            endpoint_id,
            connection,
            Arc::clone(&self.shared.clock),
        ));

        let registered = {
            let mut registry = self.shared.lock();
            if self.shared.is_closed() {
                false
            } else {
                handle.borrow();
                registry
                    .handles
                    .insert(endpoint_id.to_string(), Arc::clone(&handle));
                true
            }
        };

        if !registered {
            info!(endpoint_id = %endpoint_id, "Pool closed while connecting, discarding connection");
            creation.finish(Outcome::Closed);
            return Err(PoolError::Closed);
        }

        let total_created = self.shared.counters.total_created.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            endpoint_id = %endpoint_id,
            total_created = total_created,
            "Created new connection"
        );

        creation.finish(Outcome::Created);
        Ok(handle)
    }

    /// Give back one borrow. The handle stays registered; eviction is the reaper's call.
    pub fn release(&self, handle: &ConnectionHandle<D::Connection>) -> Result<(), PoolError> {
        self.ensure_open()?;
        handle.release()
    }

    /// Mark `handle` as broken so it is never handed out again.
    ///
    /// The handle is unregistered whatever its reference count; current
    /// holders keep their borrow until they release it. Returns whether the
    /// handle was still registered.
    pub fn report_error(
        &self,
        handle: &ConnectionHandle<D::Connection>,
        cause: impl fmt::Display,
    ) -> Result<bool, PoolError> {
        self.ensure_open()?;

        let endpoint_id = handle.endpoint_id();
        let mut registry = self.shared.lock();

        let registered = registry
            .handles
            .get(endpoint_id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), handle));
        if !registered {
            debug!(endpoint_id = %endpoint_id, error = %cause, "Error reported on unregistered connection");
            return Ok(false);
        }

        registry.handles.remove(endpoint_id);
        self.shared.counters.invalidated.fetch_add(1, Ordering::Relaxed);

        warn!(
            endpoint_id = %endpoint_id,
            ref_count = handle.ref_count(),
            error = %cause,
            "Connection reported broken, removed from pool"
        );

        Ok(true)
    }

    /// Run one eviction scan right now on the caller's thread
    pub fn evict_idle(&self) -> Result<usize, PoolError> {
        self.ensure_open()?;
        self.shared.evict_idle()
    }

    /// Wake the reaper so it scans without waiting out its sleep
    pub fn reap_now(&self) {
        self.reaper.wake();
    }

    /// Stop the reaper, drop every handle and refuse further use.
    ///
    /// In-flight dials are not awaited; their grace waits are cancelled and
    /// they find the pool closed when they finish. Closing twice is a no-op.
    pub async fn close(&self) {
        let dropped = {
            let mut registry = self.shared.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            registry.creating.clear();
            std::mem::take(&mut registry.handles).len()
        };

        self.shutdown.cancel();
        self.reaper.stop().await;

        info!(dropped = dropped, "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn reaper_running(&self) -> bool {
        self.reaper.is_running()
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.shared.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a handle is registered for `endpoint_id`
    pub fn contains(&self, endpoint_id: &str) -> bool {
        self.shared.lock().handles.contains_key(endpoint_id)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let (live_handles, outstanding_borrows) = {
            let registry = self.shared.lock();
            let borrows = registry.handles.values().map(|h| h.ref_count()).sum();
            (registry.handles.len(), borrows)
        };

        let counters = &self.shared.counters;
        PoolStats {
            total_created: counters.total_created.load(Ordering::Relaxed),
            total_reused: counters.total_reused.load(Ordering::Relaxed),
            failed_attempts: counters.failed_attempts.load(Ordering::Relaxed),
            evicted_idle: counters.evicted_idle.load(Ordering::Relaxed),
            invalidated: counters.invalidated.load(Ordering::Relaxed),
            live_handles,
            outstanding_borrows,
        }
    }
}

impl<D: Dial> Drop for ConnectionPool<D> {
    fn drop(&mut self) {
        // Lets a reaper that was never stopped exit on its next wakeup
        self.shutdown.cancel();
    }
}

impl<D: Dial> fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("linger", &self.shared.linger)
            .field("closed", &self.is_closed())
            .field("live_handles", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::FixedDialer;
    use crate::pool::clock::ManualClock;
    use crate::pool::factory::FactoryConfig;

    fn quick_factory() -> FactoryConfig {
        FactoryConfig {
            initial_retries: 0,
            initial_grace: Duration::ZERO,
            subsequent_retries: 0,
            subsequent_grace: Duration::ZERO,
        }
    }

    fn manual_pool() -> (ConnectionPool<FixedDialer<u32>>, Arc<ManualClock>) {
        let factory = Arc::new(ConnectionFactory::new(FixedDialer::new(1u32), quick_factory()));
        let clock = Arc::new(ManualClock::new());
        let pool = ConnectionPool::with_clock(factory, PoolConfig::with_linger_secs(10), clock.clone()).unwrap();
        (pool, clock)
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.linger, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_linger_rejected() {
        let factory = Arc::new(ConnectionFactory::new(FixedDialer::new(1u32), quick_factory()));
        let err = ConnectionPool::new(factory, PoolConfig::with_linger_secs(0)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_empty_endpoint_id_rejected() {
        let (pool, _clock) = manual_pool();
        let err = pool.get("").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidEndpointId));
        assert_eq!(pool.factory().dialer().attempts(""), 0);
    }

    #[tokio::test]
    async fn test_reaper_starts_lazily() {
        let (pool, _clock) = manual_pool();
        assert!(!pool.reaper_running());

        let handle = pool.get("svc").await.unwrap();
        assert!(pool.reaper_running());

        pool.release(&handle).unwrap();
        pool.close().await;
        assert!(!pool.reaper_running());
    }

    #[tokio::test]
    async fn test_evict_idle_respects_linger_and_borrows() {
        let (pool, clock) = manual_pool();

        let held = pool.get("held").await.unwrap();
        let idle = pool.get("idle").await.unwrap();
        pool.release(&idle).unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(pool.evict_idle().unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(pool.evict_idle().unwrap(), 1);
        assert!(!pool.contains("idle"));
        assert!(pool.contains("held"));
        assert_eq!(held.ref_count(), 1);

        let stats = pool.stats();
        assert_eq!(stats.evicted_idle, 1);
        assert_eq!(stats.live_handles, 1);
        assert_eq!(stats.outstanding_borrows, 1);
    }

    #[tokio::test]
    async fn test_scan_skipped_while_registry_busy() {
        let (pool, _clock) = manual_pool();
        let _handle = pool.get("svc").await.unwrap();

        let registry = pool.shared.lock();
        assert!(matches!(pool.shared.evict_idle(), Err(PoolError::Busy)));
        drop(registry);

        assert!(pool.shared.evict_idle().is_ok());
    }

    #[tokio::test]
    async fn test_report_error_ignores_replaced_handle() {
        let (pool, _clock) = manual_pool();

        let first = pool.get("svc").await.unwrap();
        assert!(pool.report_error(&first, "reset by peer").unwrap());

        let second = pool.get("svc").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        // A stale report must not knock out the replacement
        assert!(!pool.report_error(&first, "reset by peer").unwrap());
        assert!(pool.contains("svc"));
        assert_eq!(pool.stats().invalidated, 1);
    }

    #[tokio::test]
    async fn test_creation_gates_are_cleaned_up() {
        let (pool, _clock) = manual_pool();
        pool.factory().dialer().fail_next("flaky", 1);

        assert!(pool.get("flaky").await.is_err());
        assert!(pool.shared.lock().creating.is_empty());

        let handle = pool.get("flaky").await.unwrap();
        assert!(pool.shared.lock().creating.is_empty());
        pool.release(&handle).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_gets_leave_no_gates() {
        let dialer = FixedDialer::new(1u32).with_latency(Duration::from_secs(5));
        let factory = Arc::new(ConnectionFactory::new(dialer, quick_factory()));
        let pool = ConnectionPool::new(factory, PoolConfig::default()).unwrap();

        for i in 0..100 {
            let endpoint_id = format!("ep-{i}");
            let result = tokio::time::timeout(Duration::from_millis(10), pool.get(&endpoint_id)).await;
            assert!(result.is_err());
        }

        assert!(pool.shared.lock().creating.is_empty());
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_takes_over_cancelled_dial() {
        let dialer = FixedDialer::new(1u32).with_latency(Duration::from_secs(5));
        let factory = Arc::new(ConnectionFactory::new(dialer, quick_factory()));
        let pool = ConnectionPool::new(factory, PoolConfig::default()).unwrap();

        let (abandoned, waited) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(100), pool.get("svc")),
            pool.get("svc"),
        );

        assert!(abandoned.is_err());
        let handle = waited.unwrap();
        assert_eq!(handle.ref_count(), 1);
        assert_eq!(pool.factory().dialer().connected("svc"), 1);
        assert!(pool.shared.lock().creating.is_empty());
    }

    #[tokio::test(start_paused = true)]
    #[allow(clippy::await_holding_lock)]
    async fn test_reaper_recovers_from_busy_scan() {
        let factory = Arc::new(ConnectionFactory::new(FixedDialer::new(1u32), quick_factory()));
        let pool = ConnectionPool::new(factory, PoolConfig::with_linger_secs(1)).unwrap();

        let handle = pool.get("svc").await.unwrap();
        pool.release(&handle).unwrap();

        // Scans at 1s and 2s find the registry held
        let registry = pool.shared.lock();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(registry);
        assert!(pool.contains("svc"));
        assert!(pool.reaper_running());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pool.contains("svc"));
        assert!(pool.reaper_running());
        assert_eq!(pool.stats().evicted_idle, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pool, _clock) = manual_pool();
        let _handle = pool.get("svc").await.unwrap();

        pool.close().await;
        pool.close().await;

        assert!(pool.is_closed());
        assert!(pool.is_empty());
        assert!(matches!(pool.evict_idle(), Err(PoolError::Closed)));
    }
}

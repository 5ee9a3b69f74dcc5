//! Reference-counted wrapper around one pooled connection
//!
//! A [`ConnectionHandle`] owns the connection for its whole life. Callers get
//! an `Arc` to the handle from the pool and borrow the connection through it;
//! the reference count tracks how many of those borrows are outstanding so the
//! reaper knows when the handle is safe to drop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::clock::Clock;
use super::error::PoolError;

/// Reference count and last-use stamp, always updated together
#[derive(Debug, Clone, Copy)]
struct Usage {
    ref_count: u64,
    last_use: Instant,
}

/// A pooled connection with reference counting and liveness tracking
pub struct ConnectionHandle<C> {
    endpoint_id: String,
    connection: C,
    usage: Mutex<Usage>,
    clock: Arc<dyn Clock>,
    /// Releases that arrived with the count already at zero
    mismatched_releases: AtomicU64,
}

impl<C> ConnectionHandle<C> {
    /// Wrap a freshly dialed connection. The count starts at zero.
    pub fn new(endpoint_id: impl Into<String>, connection: C, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            endpoint_id: endpoint_id.into(),
            connection,
            usage: Mutex::new(Usage {
                ref_count: 0,
                last_use: now,
            }),
            clock,
            mismatched_releases: AtomicU64::new(0),
        }
    }

    fn usage(&self) -> MutexGuard<'_, Usage> {
        // Usage updates cannot panic midway, so a poisoned lock still holds consistent data
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Key this handle is registered under
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Take one more borrow on the connection
    pub fn borrow(&self) -> &Self {
        let now = self.clock.now();
        let mut usage = self.usage();
        usage.ref_count += 1;
        usage.last_use = now;
        self
    }

    /// Give back one borrow.
    ///
    /// A release with no outstanding borrow leaves the count at zero, is
    /// logged, and is reported as [`PoolError::MismatchedRelease`].
    pub fn release(&self) -> Result<(), PoolError> {
        let now = self.clock.now();
        let mut usage = self.usage();
        usage.last_use = now;

        if usage.ref_count == 0 {
            drop(usage);
            let total = self.mismatched_releases.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                endpoint_id = %self.endpoint_id,
                mismatched_releases = total,
                "Release without a matching borrow"
            );
            return Err(PoolError::MismatchedRelease {
                endpoint_id: self.endpoint_id.clone(),
            });
        }

        usage.ref_count -= 1;
        Ok(())
    }

    /// Access the connection without changing the count. Refreshes `last_use`.
    pub fn connection(&self) -> &C {
        let now = self.clock.now();
        self.usage().last_use = now;
        &self.connection
    }

    /// Number of outstanding borrows
    pub fn ref_count(&self) -> u64 {
        self.usage().ref_count
    }

    pub fn last_use(&self) -> Instant {
        self.usage().last_use
    }

    /// Time since the last borrow, release or access
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.usage().last_use)
    }

    /// Whether the reaper may drop this handle: nobody holds it and it has
    /// been idle for longer than `linger`. Both facts come from one snapshot.
    pub fn is_evictable(&self, now: Instant, linger: Duration) -> bool {
        let usage = *self.usage();
        usage.ref_count == 0 && now.saturating_duration_since(usage.last_use) > linger
    }

    pub fn mismatched_releases(&self) -> u64 {
        self.mismatched_releases.load(Ordering::Relaxed)
    }
}

impl<C> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let usage = *self.usage();
        f.debug_struct("ConnectionHandle")
            .field("endpoint_id", &self.endpoint_id)
            .field("ref_count", &usage.ref_count)
            .field("last_use", &usage.last_use)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::clock::ManualClock;
    use std::thread;

    fn handle_with_clock() -> (ConnectionHandle<u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let handle = ConnectionHandle::new("svc-a", 7u32, clock.clone());
        (handle, clock)
    }

    #[test]
    fn test_handle_creation() {
        let (handle, _clock) = handle_with_clock();
        assert_eq!(handle.endpoint_id(), "svc-a");
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(*handle.connection(), 7);
        assert_eq!(handle.mismatched_releases(), 0);
    }

    #[test]
    fn test_borrow_and_release_track_count() {
        let (handle, _clock) = handle_with_clock();

        handle.borrow();
        handle.borrow();
        assert_eq!(handle.ref_count(), 2);

        handle.release().unwrap();
        assert_eq!(handle.ref_count(), 1);
        handle.release().unwrap();
        assert_eq!(handle.ref_count(), 0);
    }

    #[test]
    fn test_mismatched_release_clamps_at_zero() {
        let (handle, _clock) = handle_with_clock();

        let err = handle.release().unwrap_err();
        assert!(matches!(err, PoolError::MismatchedRelease { .. }));
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(handle.mismatched_releases(), 1);

        // Bookkeeping stays usable afterwards
        handle.borrow();
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_every_touch_refreshes_last_use() {
        let (handle, clock) = handle_with_clock();
        let linger = Duration::from_secs(10);

        clock.advance(Duration::from_secs(4));
        assert_eq!(handle.idle_for(clock.now()), Duration::from_secs(4));

        handle.borrow();
        assert_eq!(handle.idle_for(clock.now()), Duration::ZERO);

        clock.advance(Duration::from_secs(2));
        handle.release().unwrap();
        assert_eq!(handle.idle_for(clock.now()), Duration::ZERO);

        clock.advance(Duration::from_secs(3));
        let _ = handle.connection();
        assert_eq!(handle.idle_for(clock.now()), Duration::ZERO);

        clock.advance(Duration::from_secs(11));
        assert!(handle.is_evictable(clock.now(), linger));
    }

    #[test]
    fn test_borrowed_handle_is_never_evictable() {
        let (handle, clock) = handle_with_clock();
        handle.borrow();

        clock.advance(Duration::from_secs(3600));
        assert!(!handle.is_evictable(clock.now(), Duration::from_secs(10)));

        handle.release().unwrap();
        clock.advance(Duration::from_secs(11));
        assert!(handle.is_evictable(clock.now(), Duration::from_secs(10)));
    }

    #[test]
    fn test_idle_exactly_linger_is_not_evictable() {
        let (handle, clock) = handle_with_clock();
        clock.advance(Duration::from_secs(10));
        assert!(!handle.is_evictable(clock.now(), Duration::from_secs(10)));
    }

    #[test]
    fn test_concurrent_access() {
        let (handle, _clock) = handle_with_clock();
        let handle = Arc::new(handle);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        handle.borrow();
                        handle.release().unwrap();
                    }
                    handle.borrow();
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(handle.ref_count(), 4);
        assert_eq!(handle.mismatched_releases(), 0);
    }
}

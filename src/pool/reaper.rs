//! Background eviction of idle handles
//!
//! One reaper task per pool. It is spawned on the pool's first `get`, sleeps
//! for the linger period between scans, and exits when its cancellation token
//! fires. A wake signal cuts the sleep short and forces an immediate scan.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::Shared;

enum State {
    /// Not started yet
    Idle,
    Running(JoinHandle<()>),
    /// Stopped for good; never restarts
    Stopped,
}

pub(crate) struct Reaper {
    state: Mutex<State>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    interval: Duration,
}

impl Reaper {
    pub(crate) fn new(interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            wake: Arc::new(Notify::new()),
            cancel,
            interval,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the task unless it is already running or has been stopped
    pub(crate) fn ensure_started<C>(&self, shared: &Arc<Shared<C>>)
    where
        C: Send + Sync + 'static,
    {
        let mut state = self.state();
        if !matches!(*state, State::Idle) {
            return;
        }

        let task = tokio::spawn(run(
            Arc::downgrade(shared),
            Arc::clone(&self.wake),
            self.cancel.clone(),
            self.interval,
        ));
        *state = State::Running(task);

        info!(interval_secs = self.interval.as_secs_f64(), "Reaper started");
    }

    /// Interrupt the current sleep and scan now
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    /// Signal the task and wait for it to exit
    pub(crate) async fn stop(&self) {
        let task = match std::mem::replace(&mut *self.state(), State::Stopped) {
            State::Running(task) => Some(task),
            State::Idle | State::Stopped => None,
        };

        self.cancel.cancel();

        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Reaper task ended abnormally");
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        match &*self.state() {
            State::Running(task) => !task.is_finished(),
            State::Idle | State::Stopped => false,
        }
    }
}

async fn run<C>(shared: Weak<Shared<C>>, wake: Arc<Notify>, cancel: CancellationToken, interval: Duration)
where
    C: Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = wake.notified() => debug!("Reaper woken for immediate scan"),
            () = tokio::time::sleep(interval) => {}
        }

        // Pool dropped without close
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match shared.evict_idle() {
            Ok(0) => {}
            Ok(evicted) => debug!(evicted = evicted, "Reaper scan finished"),
            Err(e) => warn!(error = %e, "Reaper scan skipped, retrying next cycle"),
        }
    }

    info!("Reaper stopped");
}

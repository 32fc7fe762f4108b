use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Interval used by the polling waits in this crate.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// What an [`Event`] does after it releases a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Stays signaled until [`Event::reset`] is called.
    Manual,
    /// Clears itself as soon as one waiter observes the signal.
    Auto,
}

/// A boolean signal that threads can block on with a timeout.
#[derive(Debug)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
    mode: ResetMode,
}

impl Event {
    pub fn new(mode: ResetMode) -> Self {
        Event {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            mode,
        }
    }

    pub fn manual() -> Self {
        Self::new(ResetMode::Manual)
    }

    pub fn auto() -> Self {
        Self::new(ResetMode::Auto)
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        match self.mode {
            ResetMode::Manual => {
                self.cond.notify_all();
            }
            ResetMode::Auto => {
                self.cond.notify_one();
            }
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock()
    }

    /// Block until the event is signaled or `timeout` elapses.
    ///
    /// Returns `true` if the signal was observed. An auto-reset event is
    /// cleared by the waiter that observes it.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut signaled = self.signaled.lock();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut signaled),
            }
        }

        let observed = *signaled;
        if observed && self.mode == ResetMode::Auto {
            *signaled = false;
        }
        observed
    }
}

/// A shared cancellation flag.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Poll `ready` every [`POLL_INTERVAL`] until it reports `true` or `timeout`
/// elapses.
///
/// Returns the last answer of `ready`. Errors from `ready` stop the polling
/// and are returned as-is.
pub fn poll_until<E>(
    timeout: Duration,
    mut ready: impl FnMut() -> Result<bool, E>,
) -> Result<bool, E> {
    let started = Instant::now();
    loop {
        if ready()? {
            return Ok(true);
        }
        if started.elapsed() >= timeout {
            return Ok(false);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

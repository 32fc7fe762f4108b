use std::fmt;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// First acquisition attempt waits this long; each retry doubles it.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

/// Default total wait before giving up on a lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A lock could not be acquired within its bound.
///
/// This signals systemic overload or a stuck holder, not a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTimeout {
    pub lock: &'static str,
    pub operation: &'static str,
    pub waited: Duration,
}

impl fmt::Display for AccessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to gain access to {} for {} after {:?}",
            self.lock, self.operation, self.waited
        )
    }
}

impl std::error::Error for AccessTimeout {}

/// A mutex acquired with exponential backoff.
///
/// Each failed attempt is logged at `warn` and retried with double the
/// previous attempt's timeout until the accumulated wait reaches `bound`.
pub struct BackoffMutex<T> {
    inner: Mutex<T>,
    lock: &'static str,
    bound: Duration,
}

impl<T> BackoffMutex<T> {
    pub fn new(lock: &'static str, value: T, bound: Duration) -> Self {
        BackoffMutex {
            inner: Mutex::new(value),
            lock,
            bound,
        }
    }

    pub fn bound(&self) -> Duration {
        self.bound
    }

    /// Acquire the lock on behalf of `operation`.
    pub fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, T>, AccessTimeout> {
        let mut attempt = INITIAL_BACKOFF;
        let mut waited = Duration::ZERO;

        loop {
            if let Some(guard) = self.inner.try_lock_for(attempt) {
                return Ok(guard);
            }

            waited += attempt;
            tracing::warn!(
                lock = self.lock,
                operation,
                waited_ms = waited.as_millis() as u64,
                "lock is contended, backing off"
            );

            if waited >= self.bound {
                return Err(AccessTimeout {
                    lock: self.lock,
                    operation,
                    waited,
                });
            }

            attempt = (attempt * 2)
                .min(self.bound - waited)
                .max(INITIAL_BACKOFF);
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for BackoffMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffMutex")
            .field("lock", &self.lock)
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}

use std::fmt;
use std::time::Duration;

use crate::backoff::{AccessTimeout, BackoffMutex};
use crate::sync::poll_until;

/// Errors returned by [`BoundedQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Every entry is occupied.
    Full { capacity: usize },
    /// The queue lock could not be acquired.
    Timeout(AccessTimeout),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full { capacity } => write!(f, "queue is full ({capacity} entries)"),
            QueueError::Timeout(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<AccessTimeout> for QueueError {
    fn from(err: AccessTimeout) -> Self {
        QueueError::Timeout(err)
    }
}

struct Ring<T> {
    entries: Box<[T]>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn slot(&self, offset: usize) -> usize {
        (self.head + offset) % self.capacity()
    }
}

/// A fixed-capacity FIFO of pre-allocated, reusable entries.
///
/// Entries are never moved in or out: `enqueue` initializes the tail entry in
/// place and `try_dequeue` hands the head entry to a consumer that copies what
/// it needs before the slot is recycled.
pub struct BoundedQueue<T> {
    ring: BackoffMutex<Ring<T>>,
    capacity: usize,
}

impl<T: Default> BoundedQueue<T> {
    /// Create a queue with `capacity` default-initialized entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(lock: &'static str, capacity: usize, lock_timeout: Duration) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let entries = (0..capacity).map(|_| T::default()).collect();
        BoundedQueue {
            ring: BackoffMutex::new(
                lock,
                Ring {
                    entries,
                    head: 0,
                    len: 0,
                },
                lock_timeout,
            ),
            capacity,
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Initialize the next free entry at the tail.
    pub fn enqueue(&self, init: impl FnOnce(&mut T)) -> Result<(), QueueError> {
        let mut ring = self.ring.lock("enqueue")?;
        if ring.len == ring.capacity() {
            return Err(QueueError::Full {
                capacity: ring.capacity(),
            });
        }

        let tail = ring.slot(ring.len);
        init(&mut ring.entries[tail]);
        ring.len += 1;
        Ok(())
    }

    /// Hand the head entry to `consume` and advance past it.
    ///
    /// Returns `false` without calling `consume` when the queue is empty.
    pub fn try_dequeue(&self, consume: impl FnOnce(&mut T)) -> Result<bool, AccessTimeout> {
        let mut ring = self.ring.lock("dequeue")?;
        if ring.len == 0 {
            return Ok(false);
        }

        let head = ring.head;
        consume(&mut ring.entries[head]);
        ring.head = ring.slot(1);
        ring.len -= 1;
        Ok(true)
    }

    /// Visit every queued entry from head to tail.
    pub fn for_each_queued(&self, mut visit: impl FnMut(&mut T)) -> Result<usize, AccessTimeout> {
        let mut ring = self.ring.lock("visit")?;
        let len = ring.len;
        for offset in 0..len {
            let index = ring.slot(offset);
            visit(&mut ring.entries[index]);
        }
        Ok(len)
    }

    pub fn len(&self) -> Result<usize, AccessTimeout> {
        Ok(self.ring.lock("len")?.len)
    }

    pub fn is_empty(&self) -> Result<bool, AccessTimeout> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Poll until the queue is empty or `timeout` elapses.
    pub fn wait_until_empty(&self, timeout: Duration) -> Result<bool, AccessTimeout> {
        poll_until(timeout, || self.is_empty())
    }
}

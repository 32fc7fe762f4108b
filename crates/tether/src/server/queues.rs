use std::time::Duration;

use tether_core::Frame;
use tether_primitives::{AccessTimeout, BoundedQueue, Event, QueueError};

use super::call::{Call, Reply};

/// A handler's inbound calls.
///
/// Every enqueue signals an auto-reset event the handler can block on.
pub(crate) struct CallQueue {
    queue: BoundedQueue<Call>,
    new_item: Event,
}

impl CallQueue {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        CallQueue {
            queue: BoundedQueue::with_capacity("call queue", capacity, lock_timeout),
            new_item: Event::auto(),
        }
    }

    pub fn enqueue(&self, frames: &[Frame], timeout: Duration) -> Result<(), QueueError> {
        self.queue
            .enqueue(|call| call.initialize(frames, timeout))?;
        self.new_item.set();
        Ok(())
    }

    /// Copy the oldest call into `out`.
    pub fn try_dequeue(&self, out: &mut Call) -> Result<bool, AccessTimeout> {
        self.queue.try_dequeue(|call| out.copy_from(call))
    }

    pub fn is_empty(&self) -> Result<bool, AccessTimeout> {
        self.queue.is_empty()
    }

    pub fn wait_for_new_item(&self, timeout: Duration) -> bool {
        self.new_item.wait(timeout)
    }

    /// Wake a handler blocked in [`CallQueue::wait_for_new_item`].
    pub fn wake(&self) {
        self.new_item.set();
    }

    /// Cancel every queued call. They stay queued and are answered `Aborted`.
    pub fn abort_all(&self) -> Result<usize, AccessTimeout> {
        self.queue.for_each_queued(|call| call.abort())
    }
}

/// A handler's outbound replies, drained by the dispatch loop.
pub(crate) struct ReplyQueue {
    queue: BoundedQueue<Reply>,
}

impl ReplyQueue {
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        ReplyQueue {
            queue: BoundedQueue::with_capacity("reply queue", capacity, lock_timeout),
        }
    }

    pub fn enqueue(&self, envelope: &[Frame], payload: Frame) -> Result<(), QueueError> {
        self.queue
            .enqueue(|reply| reply.initialize(envelope, payload))
    }

    pub fn try_dequeue(&self, out: &mut Reply) -> Result<bool, AccessTimeout> {
        self.queue.try_dequeue(|reply| out.copy_from(reply))
    }

    pub fn wait_until_empty(&self, timeout: Duration) -> Result<bool, AccessTimeout> {
        self.queue.wait_until_empty(timeout)
    }
}

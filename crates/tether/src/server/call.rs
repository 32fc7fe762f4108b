use std::time::Duration;

use tether_core::Frame;
use tether_primitives::CancellationToken;

/// Routing frames a message usually carries; entries are pre-sized for it.
pub(crate) const ENVELOPE_CAPACITY: usize = 8;

/// A queued call: the envelope frames followed by the call payload.
///
/// Entries live in a [`CallQueue`](super::queues::CallQueue) and are reused
/// in place. Each occupancy gets a fresh cancellation token; copies share it.
#[derive(Debug)]
pub(crate) struct Call {
    frames: Vec<Frame>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Default for Call {
    fn default() -> Self {
        Call {
            frames: Vec::with_capacity(ENVELOPE_CAPACITY),
            timeout: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }
}

impl Call {
    pub fn initialize(&mut self, frames: &[Frame], timeout: Duration) {
        self.frames.clear();
        self.frames.extend_from_slice(frames);
        self.timeout = timeout;
        self.cancel = CancellationToken::new();
    }

    pub fn copy_from(&mut self, other: &Call) {
        self.frames.clone_from(&other.frames);
        self.timeout = other.timeout;
        self.cancel = other.cancel.clone();
    }

    /// Every frame but the payload.
    pub fn envelope(&self) -> &[Frame] {
        match self.frames.split_last() {
            Some((_, envelope)) => envelope,
            None => &[],
        }
    }

    pub fn payload(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A queued reply: the call's envelope followed by the reply payload.
#[derive(Debug)]
pub(crate) struct Reply {
    frames: Vec<Frame>,
}

impl Default for Reply {
    fn default() -> Self {
        Reply {
            frames: Vec::with_capacity(ENVELOPE_CAPACITY),
        }
    }
}

impl Reply {
    pub fn initialize(&mut self, envelope: &[Frame], payload: Frame) {
        self.frames.clear();
        self.frames.extend_from_slice(envelope);
        self.frames.push(payload);
    }

    pub fn copy_from(&mut self, other: &Reply) {
        self.frames.clone_from(&other.frames);
    }

    /// The message to send back: envelope then payload.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

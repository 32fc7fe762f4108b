use std::sync::atomic::{AtomicU64, Ordering};

/// Per-endpoint counters.
///
/// On a client, messages sent are calls and messages received are replies
/// bound to a waiting call. On a server it is the other way round.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    stale_replies: AtomicU64,
    protocol_errors: AtomicU64,
    calls_rejected: AtomicU64,
}

/// Non-atomic snapshot of endpoint metrics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointMetricsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Replies that matched no executing call: late, duplicated or aborted.
    pub stale_replies: u64,
    /// Messages with the wrong frame count or malformed id frames.
    pub protocol_errors: u64,
    /// Calls refused locally: no free slot, endpoint not started, server
    /// overloaded.
    pub calls_rejected: u64,
}

impl EndpointMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_reply(&self) {
        self.stale_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.calls_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EndpointMetricsSnapshot {
        EndpointMetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            calls_rejected: self.calls_rejected.load(Ordering::Relaxed),
        }
    }
}

use std::time::Duration;

use tether_primitives::{DEFAULT_ARENA_CAPACITY, DEFAULT_LOCK_TIMEOUT};

/// Client channel settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Default per-call timeout.
    pub call_timeout: Duration,
    /// Most calls in flight at once; further calls fail fast.
    pub arena_capacity: usize,
    /// Bound on acquiring the arena lock.
    pub lock_timeout: Duration,
    /// Added to the call timeout while a caller waits for its reply.
    pub wait_overhead: Duration,
    pub start_timeout: Duration,
    /// How long close waits for in-flight calls before aborting them.
    pub drain_timeout: Duration,
    /// Pause between aborting calls and stopping the worker.
    pub abort_grace: Duration,
    pub join_timeout: Duration,
    /// Worker sleep when a loop iteration found nothing to do.
    pub idle_sleep: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            call_timeout: Duration::from_millis(1000),
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            wait_overhead: Duration::from_millis(100),
            start_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(10),
            abort_grace: Duration::from_millis(100),
            join_timeout: Duration::from_millis(500),
            idle_sleep: Duration::from_micros(50),
        }
    }
}

impl ChannelOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_arena_capacity(mut self, capacity: usize) -> Self {
        self.arena_capacity = capacity;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_wait_overhead(mut self, overhead: Duration) -> Self {
        self.wait_overhead = overhead;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Execution bound applied to every incoming call.
    pub call_timeout: Duration,
    /// Number of handler workers, each with its own call and reply queue.
    pub handler_count: usize,
    /// Capacity of each handler's call queue and reply queue.
    pub queue_capacity: usize,
    pub lock_timeout: Duration,
    pub start_timeout: Duration,
    /// How long a stopping handler waits for its call queue to drain.
    pub handler_drain_timeout: Duration,
    /// Second, shorter drain after queued calls were aborted.
    pub handler_abort_grace: Duration,
    pub handler_join_timeout: Duration,
    pub join_timeout: Duration,
    /// Idle loop iterations spent yielding before the loop starts sleeping.
    pub idle_spin_limit: u32,
    pub idle_sleep: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            call_timeout: Duration::from_millis(5000),
            handler_count: default_handler_count(),
            queue_capacity: 128,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            start_timeout: Duration::from_millis(500),
            handler_drain_timeout: Duration::from_secs(10),
            handler_abort_grace: Duration::from_secs(1),
            handler_join_timeout: Duration::from_millis(1100),
            join_timeout: Duration::from_millis(500),
            idle_spin_limit: 50_000,
            idle_sleep: Duration::from_millis(1),
        }
    }
}

/// Half the available parallelism, rounded up.
pub fn default_handler_count() -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    cpus.div_ceil(2).max(1)
}

impl ServerOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_handler_count(mut self, count: usize) -> Self {
        self.handler_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn with_handler_drain_timeout(mut self, timeout: Duration) -> Self {
        self.handler_drain_timeout = timeout;
        self
    }

    pub fn with_handler_abort_grace(mut self, grace: Duration) -> Self {
        self.handler_abort_grace = grace;
        self
    }

    pub fn with_handler_join_timeout(mut self, timeout: Duration) -> Self {
        self.handler_join_timeout = timeout;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_idle_spin_limit(mut self, limit: u32) -> Self {
        self.idle_spin_limit = limit;
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }
}

//! Blocking primitives shared by tether client and server endpoints.
//!
//! # Primitives
//!
//! - [`BackoffMutex`]: a mutex acquired with doubling timeouts up to a fixed
//!   bound. Running out of patience is reported as [`AccessTimeout`], which
//!   endpoints treat as fatal.
//! - [`BoundedQueue`]: a fixed-capacity ring of pre-allocated entries that are
//!   initialized in place on enqueue and copied out on dequeue.
//! - [`CallArena`]: a fixed pool of call slots threaded onto free, pending and
//!   executing lists, with `(index, sequence)` identities that reject stale
//!   replies.
//! - [`Event`] and [`CancellationToken`]: wait/notify signals.
//!
//! Everything here is plain `std` threading. Nothing spins without sleeping
//! and nothing blocks without a timeout.

pub mod arena;
pub mod backoff;
pub mod queue;
pub mod sync;

pub use arena::{
    ArenaCounts, ArenaError, CallArena, CallId, DEFAULT_ARENA_CAPACITY, OutgoingCall, SlotState,
    WaitOutcome,
};
pub use backoff::{AccessTimeout, BackoffMutex, DEFAULT_LOCK_TIMEOUT, INITIAL_BACKOFF};
pub use queue::{BoundedQueue, QueueError};
pub use sync::{CancellationToken, Event, ResetMode, poll_until};

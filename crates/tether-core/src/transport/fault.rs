//! Fault injection for the in-process transport.
//!
//! Rates are in basis points (0-10000 = 0.00%-100.00%) and apply to whole
//! router-to-dealer messages, so tests can provoke lost and duplicated
//! replies.
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_core::transport::{FaultInjector, MemHub};
//!
//! let faults = Arc::new(FaultInjector::new());
//! faults.set_duplicate_rate(10_000);
//! let hub = MemHub::new().with_fault_injector(faults);
//! # let _ = hub;
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const MAX_RATE: u32 = 10_000;

pub struct FaultInjector {
    drop_rate: AtomicU32,
    duplicate_rate: AtomicU32,
    /// Counter for generating pseudo-random values
    counter: AtomicU64,
    random_state: RandomState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    Pass,
    Drop,
    Duplicate,
}

impl FaultInjector {
    /// All faults disabled.
    pub fn new() -> Self {
        FaultInjector {
            drop_rate: AtomicU32::new(0),
            duplicate_rate: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            random_state: RandomState::new(),
        }
    }

    /// Decide what happens to the next message.
    pub fn check(&self) -> FaultAction {
        let drop_rate = self.drop_rate.load(Ordering::Relaxed);
        if drop_rate > 0 && self.rand_basis_points() < drop_rate {
            return FaultAction::Drop;
        }

        let duplicate_rate = self.duplicate_rate.load(Ordering::Relaxed);
        if duplicate_rate > 0 && self.rand_basis_points() < duplicate_rate {
            return FaultAction::Duplicate;
        }

        FaultAction::Pass
    }

    /// Values above 10000 are clamped.
    pub fn set_drop_rate(&self, rate: u32) {
        self.drop_rate.store(rate.min(MAX_RATE), Ordering::Relaxed);
    }

    /// Values above 10000 are clamped.
    pub fn set_duplicate_rate(&self, rate: u32) {
        self.duplicate_rate
            .store(rate.min(MAX_RATE), Ordering::Relaxed);
    }

    pub fn drop_rate(&self) -> u32 {
        self.drop_rate.load(Ordering::Relaxed)
    }

    pub fn duplicate_rate(&self) -> u32 {
        self.duplicate_rate.load(Ordering::Relaxed)
    }

    /// Pseudo-random value in `[0, 10000)` from a hashed counter.
    fn rand_basis_points(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = self.random_state.build_hasher();
        counter.hash(&mut hasher);
        (hasher.finish() % MAX_RATE as u64) as u32
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector")
            .field("drop_rate", &self.drop_rate())
            .field("duplicate_rate", &self.duplicate_rate())
            .finish_non_exhaustive()
    }
}

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::backoff::{AccessTimeout, BackoffMutex};
use crate::sync::{Event, poll_until};

/// Default number of call slots per client connection.
pub const DEFAULT_ARENA_CAPACITY: usize = 40;

/// Largest arena the 16-bit slot index can address.
pub const MAX_ARENA_CAPACITY: usize = u16::MAX as usize + 1;

/// Identity of one occupancy of a call slot.
///
/// The sequence number changes every time a slot is handed out, so a reply
/// carrying an old sequence number cannot bind to the slot's new call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    pub index: u16,
    pub sequence: u16,
}

impl CallId {
    pub fn new(index: u16, sequence: u16) -> Self {
        CallId { index, sequence }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.sequence)
    }
}

/// Which list a slot is currently threaded onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Free,
    Pending,
    Executing,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotState::Free => write!(f, "free"),
            SlotState::Pending => write!(f, "pending"),
            SlotState::Executing => write!(f, "executing"),
        }
    }
}

/// Errors returned by arena operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// No free slot is left.
    ResourceExhausted { capacity: usize },
    /// The slot is free, or now holds a different call.
    InvalidState {
        id: CallId,
        state: SlotState,
        current: Option<CallId>,
    },
    /// The arena lock could not be acquired.
    Timeout(AccessTimeout),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaError::ResourceExhausted { capacity } => {
                write!(f, "all {capacity} call slots are in use")
            }
            ArenaError::InvalidState { id, state, current } => match current {
                Some(current) => write!(
                    f,
                    "call {id} does not own its slot: slot is {state} holding call {current}"
                ),
                None => write!(f, "call {id} does not own its slot: slot is {state}"),
            },
            ArenaError::Timeout(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ArenaError {}

impl From<AccessTimeout> for ArenaError {
    fn from(err: AccessTimeout) -> Self {
        ArenaError::Timeout(err)
    }
}

/// How a caller's wait on its slot ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Replied(Bytes),
    TimedOut,
    Aborted,
}

/// A call handed to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingCall {
    pub id: CallId,
    pub timeout: Duration,
    pub payload: Bytes,
}

/// Number of slots on each list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaCounts {
    pub free: usize,
    pub pending: usize,
    pub executing: usize,
}

impl ArenaCounts {
    pub fn in_flight(&self) -> usize {
        self.pending + self.executing
    }
}

struct Slot {
    id: CallId,
    state: SlotState,
    timeout: Duration,
    payload: Bytes,
    reply: Option<Bytes>,
    aborted: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

struct Lists {
    slots: Vec<Slot>,
    free: List,
    pending: List,
    executing: List,
    last_sequence: u16,
}

impl Lists {
    fn new(capacity: usize) -> Self {
        let mut lists = Lists {
            slots: (0..capacity)
                .map(|index| Slot {
                    id: CallId::new(index as u16, 0),
                    state: SlotState::Free,
                    timeout: Duration::ZERO,
                    payload: Bytes::new(),
                    reply: None,
                    aborted: false,
                    prev: None,
                    next: None,
                })
                .collect(),
            free: List::default(),
            pending: List::default(),
            executing: List::default(),
            // Wraps to 0 on the first call.
            last_sequence: u16::MAX,
        };
        for index in 0..capacity {
            lists.push_back(SlotState::Free, index);
        }
        lists
    }

    fn list(&self, state: SlotState) -> &List {
        match state {
            SlotState::Free => &self.free,
            SlotState::Pending => &self.pending,
            SlotState::Executing => &self.executing,
        }
    }

    fn list_mut(&mut self, state: SlotState) -> &mut List {
        match state {
            SlotState::Free => &mut self.free,
            SlotState::Pending => &mut self.pending,
            SlotState::Executing => &mut self.executing,
        }
    }

    fn push_back(&mut self, state: SlotState, index: usize) {
        let tail = self.list(state).tail;
        {
            let slot = &mut self.slots[index];
            slot.state = state;
            slot.prev = tail;
            slot.next = None;
        }
        match tail {
            Some(tail) => self.slots[tail].next = Some(index),
            None => self.list_mut(state).head = Some(index),
        }
        let list = self.list_mut(state);
        list.tail = Some(index);
        list.len += 1;
    }

    fn unlink(&mut self, index: usize) {
        let (state, prev, next) = {
            let slot = &self.slots[index];
            (slot.state, slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev].next = next,
            None => self.list_mut(state).head = next,
        }
        match next {
            Some(next) => self.slots[next].prev = prev,
            None => self.list_mut(state).tail = prev,
        }
        self.list_mut(state).len -= 1;

        let slot = &mut self.slots[index];
        slot.prev = None;
        slot.next = None;
    }

    fn pop_front(&mut self, state: SlotState) -> Option<usize> {
        let head = self.list(state).head?;
        self.unlink(head);
        Some(head)
    }

    fn move_to(&mut self, index: usize, state: SlotState) {
        self.unlink(index);
        self.push_back(state, index);
    }

    fn indices(&self, state: SlotState) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.list(state).len);
        let mut cursor = self.list(state).head;
        while let Some(index) = cursor {
            out.push(index);
            cursor = self.slots[index].next;
        }
        out
    }

    fn counts(&self) -> ArenaCounts {
        ArenaCounts {
            free: self.free.len,
            pending: self.pending.len,
            executing: self.executing.len,
        }
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        let counts = self.counts();
        debug_assert_eq!(
            counts.free + counts.pending + counts.executing,
            self.slots.len(),
            "list sizes must add up to the arena capacity"
        );

        for state in [SlotState::Free, SlotState::Pending, SlotState::Executing] {
            let list = self.list(state);
            debug_assert_eq!(
                list.head.is_some(),
                list.tail.is_some(),
                "{state} list head and tail must be both present or both absent"
            );
            let members = self.indices(state);
            debug_assert_eq!(members.len(), list.len, "{state} list length is stale");
            debug_assert_eq!(members.last().copied(), list.tail, "{state} list tail is stale");
            for index in members {
                debug_assert_eq!(self.slots[index].state, state, "slot {index} is on the wrong list");
            }
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn check_invariants(&self) {}
}

/// Fixed pool of reusable call slots.
///
/// Slots move free -> pending -> executing -> free. Every mutation is
/// serialized by one [`BackoffMutex`]; each slot also has its own [`Event`]
/// so a caller can block on its reply without holding the lock.
pub struct CallArena {
    lists: BackoffMutex<Lists>,
    signals: Box<[Event]>,
}

impl CallArena {
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds [`MAX_ARENA_CAPACITY`].
    pub fn new(capacity: usize, lock_timeout: Duration) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        assert!(
            capacity <= MAX_ARENA_CAPACITY,
            "capacity must fit a 16-bit slot index"
        );

        let lists = Lists::new(capacity);
        lists.check_invariants();

        CallArena {
            lists: BackoffMutex::new("call arena", lists, lock_timeout),
            signals: (0..capacity).map(|_| Event::manual()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.signals.len()
    }

    /// Claim a free slot for a new call.
    pub fn add_pending(&self, payload: Bytes, timeout: Duration) -> Result<CallId, ArenaError> {
        let mut lists = self.lists.lock("add pending")?;
        let Some(index) = lists.pop_front(SlotState::Free) else {
            return Err(ArenaError::ResourceExhausted {
                capacity: self.capacity(),
            });
        };

        let sequence = lists.last_sequence.wrapping_add(1);
        lists.last_sequence = sequence;
        let id = CallId::new(index as u16, sequence);

        self.signals[index].reset();
        {
            let slot = &mut lists.slots[index];
            slot.id = id;
            slot.timeout = timeout;
            slot.payload = payload;
            slot.reply = None;
            slot.aborted = false;
        }
        lists.push_back(SlotState::Pending, index);
        lists.check_invariants();

        Ok(id)
    }

    /// Move the oldest pending call to executing and hand it to the sender.
    pub fn take_pending_for_sending(&self) -> Result<Option<OutgoingCall>, AccessTimeout> {
        let mut lists = self.lists.lock("take pending")?;
        let Some(index) = lists.pop_front(SlotState::Pending) else {
            return Ok(None);
        };
        lists.push_back(SlotState::Executing, index);
        lists.check_invariants();

        let slot = &lists.slots[index];
        Ok(Some(OutgoingCall {
            id: slot.id,
            timeout: slot.timeout,
            payload: slot.payload.clone(),
        }))
    }

    /// Bind reply data to the executing call `id`.
    ///
    /// Returns `false`, leaving the arena untouched, when no executing call
    /// matches `id` exactly, when the call was aborted, or when it already
    /// has a reply.
    pub fn set_reply(&self, id: CallId, data: Bytes) -> Result<bool, AccessTimeout> {
        let index = id.index as usize;
        if index >= self.capacity() {
            return Ok(false);
        }

        let mut lists = self.lists.lock("set reply")?;
        let slot = &mut lists.slots[index];
        if slot.state != SlotState::Executing
            || slot.id != id
            || slot.aborted
            || slot.reply.is_some()
        {
            return Ok(false);
        }

        slot.reply = Some(data);
        self.signals[index].set();
        Ok(true)
    }

    /// Block until call `id` is replied to or aborted, or `timeout` elapses.
    pub fn wait(&self, id: CallId, timeout: Duration) -> Result<WaitOutcome, ArenaError> {
        let index = id.index as usize;
        let Some(signal) = self.signals.get(index) else {
            return Err(ArenaError::InvalidState {
                id,
                state: SlotState::Free,
                current: None,
            });
        };

        if !signal.wait(timeout) {
            return Ok(WaitOutcome::TimedOut);
        }

        let lists = self.lists.lock("read reply")?;
        let slot = &lists.slots[index];
        if slot.state == SlotState::Free || slot.id != id {
            return Err(ArenaError::InvalidState {
                id,
                state: slot.state,
                current: (slot.state != SlotState::Free).then_some(slot.id),
            });
        }

        Ok(match &slot.reply {
            Some(reply) => WaitOutcome::Replied(reply.clone()),
            None => WaitOutcome::Aborted,
        })
    }

    /// Return call `id` to the free list.
    pub fn remove(&self, id: CallId) -> Result<(), ArenaError> {
        let index = id.index as usize;
        if index >= self.capacity() {
            return Err(ArenaError::InvalidState {
                id,
                state: SlotState::Free,
                current: None,
            });
        }

        let mut lists = self.lists.lock("remove")?;
        let slot = &lists.slots[index];
        if slot.state == SlotState::Free {
            return Err(ArenaError::InvalidState {
                id,
                state: SlotState::Free,
                current: None,
            });
        }
        if slot.id != id {
            return Err(ArenaError::InvalidState {
                id,
                state: slot.state,
                current: Some(slot.id),
            });
        }

        lists.move_to(index, SlotState::Free);
        let slot = &mut lists.slots[index];
        slot.payload = Bytes::new();
        slot.reply = None;
        slot.aborted = false;
        lists.check_invariants();

        Ok(())
    }

    /// Abort every pending and executing call that has no reply yet.
    ///
    /// Each aborted waiter is released once. List membership is unchanged;
    /// callers still remove their own slots. Returns the number of calls
    /// aborted.
    pub fn abort_all(&self) -> Result<usize, AccessTimeout> {
        let mut lists = self.lists.lock("abort all")?;
        let mut aborted = 0;
        for state in [SlotState::Pending, SlotState::Executing] {
            for index in lists.indices(state) {
                let slot = &mut lists.slots[index];
                if slot.reply.is_some() || slot.aborted {
                    continue;
                }
                slot.aborted = true;
                self.signals[index].set();
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    pub fn counts(&self) -> Result<ArenaCounts, AccessTimeout> {
        Ok(self.lists.lock("count")?.counts())
    }

    /// Slot indices on the given list, head first.
    pub fn indices(&self, state: SlotState) -> Result<Vec<usize>, AccessTimeout> {
        Ok(self.lists.lock("inspect")?.indices(state))
    }

    /// Poll until no call is pending or executing, or `timeout` elapses.
    pub fn wait_for_drain(&self, timeout: Duration) -> Result<bool, AccessTimeout> {
        poll_until(timeout, || Ok(self.counts()?.in_flight() == 0))
    }
}

impl fmt::Debug for CallArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallArena")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

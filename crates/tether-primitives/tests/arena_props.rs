//! Property tests for the call slot arena.
//!
//! Random operation sequences are replayed against the arena and a simple
//! model (a FIFO of pending ids and a set of executing ids). After every step
//! the list sizes must add up to the capacity and agree with the model.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tether_primitives::{ArenaError, CallArena, CallId, DEFAULT_LOCK_TIMEOUT, SlotState};

const CAPACITY: usize = 6;

#[derive(Debug, Clone)]
enum Op {
    Add,
    Take,
    Reply { pick: usize, stale: bool },
    Remove { pick: usize },
    RemoveStale { pick: usize },
    Abort,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Add),
        3 => Just(Op::Take),
        2 => (any::<usize>(), any::<bool>()).prop_map(|(pick, stale)| Op::Reply { pick, stale }),
        2 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
        1 => any::<usize>().prop_map(|pick| Op::RemoveStale { pick }),
        1 => Just(Op::Abort),
    ]
}

#[derive(Default)]
struct Model {
    pending: VecDeque<CallId>,
    executing: Vec<CallId>,
    replied: Vec<CallId>,
    aborted: Vec<CallId>,
}

impl Model {
    fn live(&self) -> Vec<CallId> {
        self.pending
            .iter()
            .chain(self.executing.iter())
            .copied()
            .collect()
    }

    fn forget(&mut self, id: CallId) {
        self.pending.retain(|p| *p != id);
        self.executing.retain(|e| *e != id);
        self.replied.retain(|r| *r != id);
        self.aborted.retain(|a| *a != id);
    }
}

fn check_counts(arena: &CallArena, model: &Model) -> Result<(), TestCaseError> {
    let counts = arena.counts().unwrap();
    prop_assert_eq!(counts.free + counts.pending + counts.executing, CAPACITY);
    prop_assert_eq!(counts.pending, model.pending.len());
    prop_assert_eq!(counts.executing, model.executing.len());

    let pending: Vec<usize> = model.pending.iter().map(|id| id.index as usize).collect();
    prop_assert_eq!(arena.indices(SlotState::Pending).unwrap(), pending);
    Ok(())
}

proptest! {
    #[test]
    fn list_sizes_always_add_up(ops in prop::collection::vec(op(), 1..120)) {
        let arena = CallArena::new(CAPACITY, DEFAULT_LOCK_TIMEOUT);
        let mut model = Model::default();

        for op in ops {
            match op {
                Op::Add => match arena.add_pending(Bytes::new(), Duration::from_secs(1)) {
                    Ok(id) => model.pending.push_back(id),
                    Err(ArenaError::ResourceExhausted { capacity }) => {
                        prop_assert_eq!(capacity, CAPACITY);
                        prop_assert_eq!(model.live().len(), CAPACITY);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {other}"),
                },
                Op::Take => {
                    let taken = arena.take_pending_for_sending().unwrap();
                    let expected = model.pending.pop_front();
                    prop_assert_eq!(taken.map(|call| call.id), expected);
                    if let Some(id) = expected {
                        model.executing.push(id);
                    }
                }
                Op::Reply { pick, stale } => {
                    let live = model.live();
                    if live.is_empty() {
                        continue;
                    }
                    let target = live[pick % live.len()];
                    let id = if stale {
                        CallId::new(target.index, target.sequence.wrapping_sub(1))
                    } else {
                        target
                    };
                    let bound = arena.set_reply(id, Bytes::from_static(b"reply")).unwrap();
                    let expected = !stale
                        && model.executing.contains(&id)
                        && !model.replied.contains(&id)
                        && !model.aborted.contains(&id);
                    prop_assert_eq!(bound, expected);
                    if bound {
                        model.replied.push(id);
                    }
                }
                Op::Remove { pick } => {
                    let live = model.live();
                    if live.is_empty() {
                        continue;
                    }
                    let id = live[pick % live.len()];
                    arena.remove(id).unwrap();
                    model.forget(id);
                }
                Op::RemoveStale { pick } => {
                    let index = (pick % CAPACITY) as u16;
                    let live = model.live().into_iter().find(|id| id.index == index);
                    let id = match live {
                        Some(id) => CallId::new(index, id.sequence.wrapping_add(1)),
                        None => CallId::new(index, 0),
                    };
                    let is_invalid_state = matches!(
                        arena.remove(id),
                        Err(ArenaError::InvalidState { .. })
                    );
                    prop_assert!(is_invalid_state);
                }
                Op::Abort => {
                    let aborted = arena.abort_all().unwrap();
                    let newly: Vec<CallId> = model
                        .live()
                        .into_iter()
                        .filter(|id| !model.replied.contains(id) && !model.aborted.contains(id))
                        .collect();
                    prop_assert_eq!(aborted, newly.len());
                    model.aborted.extend(newly);
                }
            }
            check_counts(&arena, &model)?;
        }
    }
}

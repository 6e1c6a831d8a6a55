//! What a provider sees while handling an event.

use crate::error::Result;
use crate::statesystem::StateSystem;
use crate::types::{Quark, StateValue, Timestamp};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::Deref;

/// A state change scheduled for a later time.
#[derive(Clone, Debug, PartialEq)]
pub enum FutureChange {
    Modify(StateValue),
    Push(StateValue),
    Pop,
}

#[derive(Debug)]
struct FutureEvent {
    time: Timestamp,
    seq: u64,
    quark: Quark,
    change: FutureChange,
}

impl PartialEq for FutureEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for FutureEvent {}

impl PartialOrd for FutureEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FutureEvent {
    // Min-heap on (time, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

/// Scheduled changes, applied in time order, ties in scheduling order.
#[derive(Debug, Default)]
pub struct FutureEvents {
    heap: BinaryHeap<FutureEvent>,
    next_seq: u64,
}

impl FutureEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: Timestamp, quark: Quark, change: FutureChange) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(FutureEvent {
            time,
            seq,
            quark,
            change,
        });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Apply every change due at or before `t`.
    pub fn apply_until(&mut self, t: Timestamp, ss: &StateSystem) -> Result<()> {
        while self.heap.peek().is_some_and(|e| e.time <= t) {
            if let Some(event) = self.heap.pop() {
                apply(event, ss)?;
            }
        }
        Ok(())
    }

    /// Apply everything left.
    pub fn apply_all(&mut self, ss: &StateSystem) -> Result<()> {
        while let Some(event) = self.heap.pop() {
            apply(event, ss)?;
        }
        Ok(())
    }
}

fn apply(event: FutureEvent, ss: &StateSystem) -> Result<()> {
    match event.change {
        FutureChange::Modify(value) => ss.modify_attribute(event.time, value, event.quark),
        FutureChange::Push(value) => ss.push_attribute(event.time, value, event.quark),
        FutureChange::Pop => ss.pop_attribute(event.time, event.quark).map(|_| ()),
    }
}

/// Handle passed to [`StateProvider::event_handle`](super::StateProvider::event_handle).
///
/// Dereferences to the target [`StateSystem`].
pub struct ProviderContext<'a> {
    ss: &'a StateSystem,
    future: &'a mut FutureEvents,
}

impl<'a> ProviderContext<'a> {
    pub fn new(ss: &'a StateSystem, future: &'a mut FutureEvents) -> Self {
        Self { ss, future }
    }

    pub fn state_system(&self) -> &StateSystem {
        self.ss
    }

    /// Schedule `change` on `quark` at `time`. It is applied before the first
    /// event at or after `time`, or when the stream ends.
    pub fn add_future_event(&mut self, time: Timestamp, quark: Quark, change: FutureChange) {
        self.future.push(time, quark, change);
    }
}

impl Deref for ProviderContext<'_> {
    type Target = StateSystem;

    fn deref(&self) -> &StateSystem {
        self.ss
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    #[test]
    fn test_future_events_in_time_order() {
        let ss = StateSystem::new(Box::new(InMemoryBackend::new("future", 0)));
        let a = ss.quark_absolute_and_add(&["A"]).unwrap();

        let mut future = FutureEvents::new();
        future.push(20, a, FutureChange::Modify(StateValue::Int(2)));
        future.push(10, a, FutureChange::Modify(StateValue::Int(1)));
        future.push(30, a, FutureChange::Modify(StateValue::Int(3)));

        future.apply_until(25, &ss).unwrap();
        assert_eq!(future.len(), 1);
        assert_eq!(ss.query_ongoing(a).unwrap(), StateValue::Int(2));
        assert_eq!(ss.ongoing_start_time(a).unwrap(), 20);

        future.apply_all(&ss).unwrap();
        assert!(future.is_empty());
        assert_eq!(ss.query_ongoing(a).unwrap(), StateValue::Int(3));
    }

    #[test]
    fn test_context_derefs_to_state_system() {
        let ss = StateSystem::new(Box::new(InMemoryBackend::new("ctx", 0)));
        let mut future = FutureEvents::new();
        let mut ctx = ProviderContext::new(&ss, &mut future);

        let q = ctx.quark_absolute_and_add(&["Stack"]).unwrap();
        ctx.add_future_event(5, q, FutureChange::Push(StateValue::Int(1)));
        assert_eq!(ctx.state_system().nb_attributes(), 1);
        assert_eq!(future.len(), 1);
    }
}

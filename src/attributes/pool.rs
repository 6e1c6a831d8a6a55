//! Recycling allocator for quarks under a base attribute.

use crate::error::{Result, StateError};
use crate::statesystem::StateSystem;
use crate::types::{Quark, Timestamp};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

/// Order in which released quarks are handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PoolOrder {
    /// Oldest released quark first.
    #[default]
    Fifo,
    /// Lowest quark number first.
    Priority,
}

enum FreeList {
    Fifo(VecDeque<Quark>),
    Priority(BinaryHeap<Reverse<Quark>>),
}

impl FreeList {
    fn new(order: PoolOrder) -> Self {
        match order {
            PoolOrder::Fifo => FreeList::Fifo(VecDeque::new()),
            PoolOrder::Priority => FreeList::Priority(BinaryHeap::new()),
        }
    }

    fn pop(&mut self) -> Option<Quark> {
        match self {
            FreeList::Fifo(queue) => queue.pop_front(),
            FreeList::Priority(heap) => heap.pop().map(|Reverse(q)| q),
        }
    }

    fn push(&mut self, quark: Quark) {
        match self {
            FreeList::Fifo(queue) => queue.push_back(quark),
            FreeList::Priority(heap) => heap.push(Reverse(quark)),
        }
    }

    fn len(&self) -> usize {
        match self {
            FreeList::Fifo(queue) => queue.len(),
            FreeList::Priority(heap) => heap.len(),
        }
    }
}

/// Pool of attributes named `"0"`, `"1"`, ... under a base attribute.
///
/// Owned by a state provider and only used from the pipeline worker.
/// A released quark keeps its sub-attributes; only their values are cleared.
pub struct AttributePool {
    base: Quark,
    order: PoolOrder,
    free: FreeList,
    in_use: HashSet<Quark>,
    next_name: u64,
}

impl AttributePool {
    /// Create a pool under `base`, which must exist in `ss`.
    pub fn new(ss: &StateSystem, base: Quark, order: PoolOrder) -> Result<Self> {
        if !ss.attribute_tree().contains(base) {
            return Err(StateError::InvalidQuark(base));
        }
        Ok(Self {
            base,
            order,
            free: FreeList::new(order),
            in_use: HashSet::new(),
            next_name: 0,
        })
    }

    pub fn base(&self) -> Quark {
        self.base
    }

    pub fn order(&self) -> PoolOrder {
        self.order
    }

    /// Take a free quark, or create the next `base/<n>` attribute.
    pub fn acquire(&mut self, ss: &StateSystem) -> Result<Quark> {
        let quark = match self.free.pop() {
            Some(q) => q,
            None => {
                let name = self.next_name.to_string();
                let q = ss.quark_relative_and_add(self.base, &[name])?;
                self.next_name += 1;
                q
            }
        };
        self.in_use.insert(quark);
        Ok(quark)
    }

    /// Nullify `quark` and its subtree at `time` and return it to the pool.
    pub fn release(&mut self, ss: &StateSystem, quark: Quark, time: Timestamp) -> Result<()> {
        if !self.in_use.contains(&quark) {
            return Err(StateError::NotInUse(quark));
        }
        ss.remove_attribute(time, quark)?;
        self.in_use.remove(&quark);
        self.free.push(quark);
        Ok(())
    }

    pub fn is_in_use(&self, quark: Quark) -> bool {
        self.in_use.contains(&quark)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    pub fn available_count(&self) -> usize {
        self.free.len()
    }
}

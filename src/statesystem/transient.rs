//! Ongoing (not yet closed) state of every attribute.

use crate::backend::StateBackend;
use crate::error::{Result, StateError};
use crate::types::{Interval, Quark, StateValue, Timestamp, ValueType};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Clone, Debug)]
struct Ongoing {
    value: StateValue,
    start: Timestamp,
    value_type: Option<ValueType>,
}

/// Ongoing value and start time per quark.
///
/// Closed intervals are handed to the backend while the write lock is held,
/// so a reader sees either the old ongoing interval or the new one, never a
/// state where the closed part is missing from both.
pub(crate) struct TransientState {
    start: Timestamp,
    entries: RwLock<Vec<Ongoing>>,
    latest: AtomicI64,
    active: AtomicBool,
}

impl TransientState {
    pub(crate) fn new(start: Timestamp) -> Self {
        Self {
            start,
            entries: RwLock::new(Vec::new()),
            latest: AtomicI64::new(start),
            active: AtomicBool::new(true),
        }
    }

    /// State of a reopened, complete history: nothing ongoing.
    pub(crate) fn inactive(start: Timestamp) -> Self {
        let state = Self::new(start);
        state.active.store(false, Ordering::SeqCst);
        state
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Latest time seen by a write or by [`TransientState::advance_time`].
    pub(crate) fn latest_time(&self) -> Timestamp {
        self.latest.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_time(&self, t: Timestamp) {
        self.latest.fetch_max(t, Ordering::SeqCst);
    }

    fn empty_entry(&self) -> Ongoing {
        Ongoing {
            value: StateValue::Null,
            start: self.start,
            value_type: None,
        }
    }

    fn ensure(&self, entries: &mut Vec<Ongoing>, quark: Quark) {
        let index = quark.index();
        if index >= entries.len() {
            let empty = self.empty_entry();
            entries.resize(index + 1, empty);
        }
    }

    fn check_type(entry: &mut Ongoing, quark: Quark, value: &StateValue) -> Result<()> {
        if let Some(got) = value.value_type() {
            match entry.value_type {
                Some(expected) if expected != got => {
                    return Err(StateError::StateValueType {
                        quark,
                        expected,
                        got,
                    });
                }
                Some(_) => {}
                None => entry.value_type = Some(got),
            }
        }
        Ok(())
    }

    /// Close the ongoing interval of `quark` at `t - 1` and start a new one
    /// holding `value` at `t`. A change to the value already held is a no-op.
    pub(crate) fn process_state_change(
        &self,
        t: Timestamp,
        value: StateValue,
        quark: Quark,
        backend: &dyn StateBackend,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if !self.is_active() {
            return Err(StateError::ClosedStore);
        }
        self.ensure(&mut entries, quark);
        let entry = &mut entries[quark.index()];

        Self::check_type(entry, quark, &value)?;
        if t < entry.start {
            return Err(StateError::OutOfOrder {
                quark,
                time: t,
                last_end: entry.start - 1,
            });
        }
        if entry.value == value {
            self.advance_time(t);
            return Ok(());
        }

        if entry.start < t {
            backend.insert_past_state(entry.start, t - 1, quark, &entry.value)?;
            entry.start = t;
        }
        entry.value = value;
        self.advance_time(t);
        Ok(())
    }

    /// Store `[start, end]` for `quark`. The gap since the ongoing start is
    /// closed with the ongoing value first; afterwards the attribute is null
    /// from `end + 1`.
    pub(crate) fn insert_past_state(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        value: StateValue,
        backend: &dyn StateBackend,
    ) -> Result<()> {
        if start > end {
            return Err(StateError::InvalidInterval { start, end });
        }
        let mut entries = self.entries.write();
        if !self.is_active() {
            return Err(StateError::ClosedStore);
        }
        self.ensure(&mut entries, quark);
        let entry = &mut entries[quark.index()];

        Self::check_type(entry, quark, &value)?;
        if start < entry.start {
            return Err(StateError::OutOfOrder {
                quark,
                time: start,
                last_end: entry.start - 1,
            });
        }
        if start > entry.start {
            backend.insert_past_state(entry.start, start - 1, quark, &entry.value)?;
        }
        backend.insert_past_state(start, end, quark, &value)?;
        entry.value = StateValue::Null;
        entry.start = end.saturating_add(1);
        self.advance_time(end);
        Ok(())
    }

    /// Change the ongoing value of `quark` without creating an interval.
    pub(crate) fn update_ongoing(&self, quark: Quark, value: StateValue) -> Result<()> {
        let mut entries = self.entries.write();
        self.ensure(&mut entries, quark);
        let entry = &mut entries[quark.index()];
        Self::check_type(entry, quark, &value)?;
        entry.value = value;
        Ok(())
    }

    /// Replace the ongoing state with the given intervals, one slot per quark.
    pub(crate) fn replace_ongoing(&self, intervals: &[Option<Interval>]) {
        let mut entries = self.entries.write();
        entries.clear();
        for slot in intervals {
            let mut entry = self.empty_entry();
            if let Some(interval) = slot {
                entry.start = interval.start;
                entry.value_type = interval.value.value_type();
                entry.value = interval.value.clone();
            }
            entries.push(entry);
        }
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn value(&self, quark: Quark) -> StateValue {
        self.entries
            .read()
            .get(quark.index())
            .map(|e| e.value.clone())
            .unwrap_or_default()
    }

    pub(crate) fn start_of(&self, quark: Quark) -> Timestamp {
        self.entries
            .read()
            .get(quark.index())
            .map(|e| e.start)
            .unwrap_or(self.start)
    }

    fn interval_in(&self, entries: &[Ongoing], quark: Quark, end: Timestamp) -> Interval {
        match entries.get(quark.index()) {
            Some(e) => Interval::new(quark, e.start, end.max(e.start), e.value.clone()),
            None => Interval::new(quark, self.start, end.max(self.start), StateValue::Null),
        }
    }

    /// Ongoing interval of `quark` ending at `end`, whatever its start.
    pub(crate) fn ongoing_interval(&self, quark: Quark, end: Timestamp) -> Interval {
        let entries = self.entries.read();
        self.interval_in(&entries, quark, end)
    }

    /// Ongoing interval of `quark` if it covers `t`. `end` is the end
    /// reported for it.
    ///
    /// `active` is read under the lock: once it is cleared, every ongoing
    /// interval is already in the backend.
    pub(crate) fn interval_at(&self, t: Timestamp, quark: Quark, end: Timestamp) -> Option<Interval> {
        let entries = self.entries.read();
        if !self.is_active() {
            return None;
        }
        let interval = self.interval_in(&entries, quark, end);
        (interval.start <= t).then_some(interval)
    }

    /// Fill every empty slot whose ongoing interval covers `t`.
    pub(crate) fn do_query(&self, states: &mut [Option<Interval>], t: Timestamp, end: Timestamp) {
        let entries = self.entries.read();
        if !self.is_active() {
            return;
        }
        for (index, slot) in states.iter_mut().enumerate() {
            if slot.is_some() {
                continue;
            }
            let quark = Quark::from_index(index);
            let (start, value) = match entries.get(index) {
                Some(e) => (e.start, e.value.clone()),
                None => (self.start, StateValue::Null),
            };
            if start <= t {
                *slot = Some(Interval::new(quark, start, end, value));
            }
        }
    }

    /// Flush every ongoing interval to the backend as `[start, end]` and stop
    /// accepting writes. Values stay readable.
    ///
    /// The write lock is held until `active` is cleared, so readers see
    /// either the ongoing intervals or the flushed ones.
    pub(crate) fn close(
        &self,
        end: Timestamp,
        nb_attributes: usize,
        backend: &dyn StateBackend,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        if !self.is_active() {
            return Err(StateError::ClosedStore);
        }
        if nb_attributes > entries.len() {
            let empty = self.empty_entry();
            entries.resize(nb_attributes, empty);
        }
        for (index, entry) in entries.iter().enumerate() {
            if entry.start <= end {
                backend.insert_past_state(entry.start, end, Quark::from_index(index), &entry.value)?;
            }
        }
        self.advance_time(end);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

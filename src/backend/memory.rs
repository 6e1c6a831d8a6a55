//! In-memory backend.

use super::{IntervalTail, StateBackend};
use crate::attributes::AttributeTree;
use crate::error::Result;
use crate::types::{BackendType, Interval, Quark, StateValue, Timestamp};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

/// Keeps every interval in memory, per attribute, sorted by time.
pub struct InMemoryBackend {
    ssid: String,
    start: Timestamp,
    end: AtomicI64,
    intervals: RwLock<Vec<Vec<Interval>>>,
    tail: IntervalTail,
}

impl InMemoryBackend {
    pub fn new(ssid: impl Into<String>, start: Timestamp) -> Self {
        Self {
            ssid: ssid.into(),
            start,
            end: AtomicI64::new(start),
            intervals: RwLock::new(Vec::new()),
            tail: IntervalTail::new(start),
        }
    }

    /// Number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.intervals.read().iter().map(Vec::len).sum()
    }
}

/// Interval of a time-sorted, contiguous list covering `t`.
pub(crate) fn find_covering(intervals: &[Interval], t: Timestamp) -> Option<&Interval> {
    let index = intervals.partition_point(|i| i.end < t);
    intervals.get(index).filter(|i| i.start <= t)
}

impl StateBackend for InMemoryBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn backend_type(&self) -> BackendType {
        BackendType::InMemory
    }

    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end.load(Ordering::SeqCst)
    }

    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: &StateValue,
    ) -> Result<()> {
        self.tail.advance(quark, start, end)?;

        let mut intervals = self.intervals.write();
        let index = quark.index();
        if index >= intervals.len() {
            intervals.resize_with(index + 1, Vec::new);
        }
        intervals[index].push(Interval::new(quark, start, end, value.clone()));
        self.end.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    fn finished_building(&self, end: Timestamp, _tree: &AttributeTree) -> Result<()> {
        self.tail.close()?;
        self.end.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    fn do_query(&self, states: &mut [Option<Interval>], t: Timestamp) -> Result<()> {
        let intervals = self.intervals.read();
        for (slot, list) in states.iter_mut().zip(intervals.iter()) {
            if let Some(interval) = find_covering(list, t) {
                *slot = Some(interval.clone());
            }
        }
        Ok(())
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<Interval>> {
        let intervals = self.intervals.read();
        Ok(intervals
            .get(quark.index())
            .and_then(|list| find_covering(list, t))
            .cloned())
    }

    fn dispose(&self) {
        self.intervals.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StateError;

    #[test]
    fn test_insert_and_query() {
        let backend = InMemoryBackend::new("mem", 0);
        backend.insert_past_state(0, 9, Quark(0), &StateValue::Int(1)).unwrap();
        backend.insert_past_state(10, 19, Quark(0), &StateValue::Int(2)).unwrap();
        backend.insert_past_state(0, 4, Quark(1), &StateValue::Null).unwrap();

        let interval = backend.do_single_query(15, Quark(0)).unwrap().unwrap();
        assert_eq!((interval.start, interval.end), (10, 19));
        assert_eq!(interval.value, StateValue::Int(2));
        assert!(backend.do_single_query(20, Quark(0)).unwrap().is_none());
        assert!(backend.do_single_query(1, Quark(7)).unwrap().is_none());
        assert_eq!(backend.end_time(), 19);
        assert_eq!(backend.interval_count(), 3);
    }

    #[test]
    fn test_full_query_leaves_unknown_slots() {
        let backend = InMemoryBackend::new("mem", 0);
        backend.insert_past_state(0, 9, Quark(0), &StateValue::Int(1)).unwrap();

        let mut states = vec![None, None];
        backend.do_query(&mut states, 5).unwrap();
        assert_eq!(states[0].as_ref().unwrap().value, StateValue::Int(1));
        assert!(states[1].is_none());
    }

    #[test]
    fn test_closed_backend_rejects_writes() {
        let backend = InMemoryBackend::new("mem", 0);
        let tree = AttributeTree::new();
        backend.finished_building(50, &tree).unwrap();

        assert_eq!(backend.end_time(), 50);
        assert!(matches!(
            backend.insert_past_state(0, 9, Quark(0), &StateValue::Int(1)),
            Err(StateError::ClosedStore)
        ));
    }
}

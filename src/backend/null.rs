//! Backend that keeps no history.

use super::{IntervalTail, StateBackend};
use crate::attributes::AttributeTree;
use crate::error::Result;
use crate::types::{BackendType, Interval, Quark, StateValue, Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};

/// Discards every closed interval. Only the ongoing state of the owning
/// state system can be queried.
pub struct NullBackend {
    ssid: String,
    start: Timestamp,
    end: AtomicI64,
    tail: IntervalTail,
}

impl NullBackend {
    pub fn new(ssid: impl Into<String>, start: Timestamp) -> Self {
        Self {
            ssid: ssid.into(),
            start,
            end: AtomicI64::new(start),
            tail: IntervalTail::new(start),
        }
    }
}

impl StateBackend for NullBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Null
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
        _value: &StateValue,
    ) -> Result<()> {
        self.tail.advance(quark, start, end)?;
        self.end.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    fn finished_building(&self, end: Timestamp, _tree: &AttributeTree) -> Result<()> {
        self.tail.close()?;
        self.end.fetch_max(end, Ordering::SeqCst);
        Ok(())
    }

    fn do_query(&self, _states: &mut [Option<Interval>], _t: Timestamp) -> Result<()> {
        Ok(())
    }

    fn do_single_query(&self, _t: Timestamp, _quark: Quark) -> Result<Option<Interval>> {
        Ok(None)
    }

    fn keeps_history(&self) -> bool {
        false
    }
}

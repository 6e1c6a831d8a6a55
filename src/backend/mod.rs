//! Interval storage strategies.
//!
//! Every backend implements [`StateBackend`]: closed intervals are appended
//! in increasing time order per attribute by the single pipeline worker and
//! read back by any number of query threads.

mod history_file;
mod memory;
mod null;
mod partial;

pub use history_file::{HistoryFileBackend, HISTORY_FILE_EXTENSION};
pub use memory::InMemoryBackend;
pub use null::NullBackend;
pub use partial::PartialHistoryBackend;

use crate::attributes::AttributeTree;
use crate::error::{Result, StateError};
use crate::types::{BackendType, Interval, Quark, StateValue, Timestamp};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Storage contract shared by the Full, Partial, InMemory and Null backends.
pub trait StateBackend: Send + Sync {
    /// Id of the state system this backend stores.
    fn ssid(&self) -> &str;

    fn backend_type(&self) -> BackendType;

    fn start_time(&self) -> Timestamp;

    /// Latest end time of anything stored so far.
    fn end_time(&self) -> Timestamp;

    /// Store the closed interval `[start, end]` of `quark`.
    ///
    /// Fails with `OutOfOrder` if `start` is not after the end of the last
    /// interval stored for `quark`, and with `ClosedStore` once
    /// [`StateBackend::finished_building`] has been called.
    fn insert_past_state(
        &self,
        start: Timestamp,
        end: Timestamp,
        quark: Quark,
        value: &StateValue,
    ) -> Result<()>;

    /// Freeze the backend at `end`. All ongoing intervals have already been
    /// flushed through [`StateBackend::insert_past_state`].
    fn finished_building(&self, end: Timestamp, tree: &AttributeTree) -> Result<()>;

    /// Serialized attribute tree of a reopened history, if any.
    fn attribute_tree(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether this backend was reopened from a complete artifact.
    fn is_complete(&self) -> bool {
        false
    }

    /// Fill `states[q]` with the stored interval of quark `q` covering `t`.
    /// Entries for which nothing is stored are left untouched.
    fn do_query(&self, states: &mut [Option<Interval>], t: Timestamp) -> Result<()>;

    /// Stored interval of `quark` covering `t`, if any.
    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<Interval>>;

    /// Called by the pipeline with the timestamp of each event before it is
    /// handled.
    fn advance_time(&self, _t: Timestamp) {}

    /// Whether past intervals can be queried at all.
    fn keeps_history(&self) -> bool {
        true
    }

    fn file_path(&self) -> Option<&Path> {
        None
    }

    fn file_size(&self) -> Option<u64> {
        None
    }

    /// Delete any on-disk artifact.
    fn remove_files(&self) -> Result<()> {
        Ok(())
    }

    /// The build will never finish. Releases anything waiting on it.
    fn abort(&self) {}

    /// Release resources. Further queries may fail.
    fn dispose(&self) {}
}

/// Per-attribute append order check shared by the backends.
pub(crate) struct IntervalTail {
    start: Timestamp,
    last_ends: RwLock<Vec<Timestamp>>,
    closed: AtomicBool,
}

impl IntervalTail {
    pub(crate) fn new(start: Timestamp) -> Self {
        Self {
            start,
            last_ends: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Accept `[start, end]` as the next interval of `quark` or fail.
    pub(crate) fn advance(&self, quark: Quark, start: Timestamp, end: Timestamp) -> Result<()> {
        if self.is_closed() {
            return Err(StateError::ClosedStore);
        }
        if !quark.is_valid() {
            return Err(StateError::InvalidQuark(quark));
        }
        if start > end {
            return Err(StateError::InvalidInterval { start, end });
        }

        let mut last_ends = self.last_ends.write();
        let index = quark.index();
        if index >= last_ends.len() {
            last_ends.resize(index + 1, self.start.saturating_sub(1));
        }
        let last_end = last_ends[index];
        if start <= last_end {
            return Err(StateError::OutOfOrder {
                quark,
                time: start,
                last_end,
            });
        }
        last_ends[index] = end;
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StateError::ClosedStore);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

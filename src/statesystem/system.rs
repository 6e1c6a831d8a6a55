//! The state system: attribute tree, ongoing state and backend together.

use super::transient::TransientState;
use crate::attributes::AttributeTree;
use crate::backend::StateBackend;
use crate::error::{Result, StateError};
use crate::types::{BackendType, Interval, Quark, StateValue, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Maximum depth of a stack attribute.
pub const MAX_STACK_DEPTH: i32 = 100_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildState {
    Building,
    Built,
    Aborted,
}

/// Builder and query facade of one state history.
///
/// Providers write through it from the pipeline worker; any thread may
/// query it, also while it is being built.
pub struct StateSystem {
    ssid: String,
    tree: Arc<AttributeTree>,
    transient: TransientState,
    backend: Box<dyn StateBackend>,
    build_state: Mutex<BuildState>,
    built: Condvar,
    disposed: AtomicBool,
}

impl StateSystem {
    /// New, empty state system writing into `backend`.
    pub fn new(backend: Box<dyn StateBackend>) -> Self {
        Self::with_tree(Arc::new(AttributeTree::new()), backend)
    }

    /// New state system sharing an existing attribute tree.
    pub fn with_tree(tree: Arc<AttributeTree>, backend: Box<dyn StateBackend>) -> Self {
        let start = backend.start_time();
        Self {
            ssid: backend.ssid().to_string(),
            tree,
            transient: TransientState::new(start),
            backend,
            build_state: Mutex::new(BuildState::Building),
            built: Condvar::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// State system over a backend reopened from a complete history. Already
    /// built; every write fails with `ClosedStore`.
    pub fn open_existing(backend: Box<dyn StateBackend>) -> Result<Self> {
        Self::open_existing_with_tree(Arc::new(AttributeTree::new()), backend)
    }

    /// Like [`StateSystem::open_existing`], loading the tree into `tree`.
    pub fn open_existing_with_tree(
        tree: Arc<AttributeTree>,
        backend: Box<dyn StateBackend>,
    ) -> Result<Self> {
        let bytes = backend.attribute_tree().ok_or_else(|| {
            StateError::InvalidOperation("backend holds no completed history".to_string())
        })?;
        tree.load_bytes(&bytes)?;
        let start = backend.start_time();
        Ok(Self {
            ssid: backend.ssid().to_string(),
            tree,
            transient: TransientState::inactive(start),
            backend,
            build_state: Mutex::new(BuildState::Built),
            built: Condvar::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn backend(&self) -> &dyn StateBackend {
        self.backend.as_ref()
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    pub fn attribute_tree(&self) -> &Arc<AttributeTree> {
        &self.tree
    }

    pub fn start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    /// Latest time covered so far: the last event seen, the latest state
    /// change, or the backend end time.
    pub fn current_end_time(&self) -> Timestamp {
        self.backend.end_time().max(self.transient.latest_time())
    }

    /// Record that every event before `t` has been handled.
    pub fn advance_time(&self, t: Timestamp) {
        self.transient.advance_time(t);
        self.backend.advance_time(t);
    }

    // --- Attribute tree ---

    pub fn nb_attributes(&self) -> usize {
        self.tree.len()
    }

    /// Quark of an absolute path, `AttributeNotFound` if it does not exist.
    pub fn quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.tree
            .lookup_quark(None, path)?
            .ok_or_else(|| not_found(path))
    }

    pub fn opt_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.tree.lookup_quark(None, path).ok().flatten()
    }

    pub fn quark_absolute_and_add<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.tree.get_or_create_quark(None, path)
    }

    pub fn quark_relative<S: AsRef<str>>(&self, base: Quark, path: &[S]) -> Result<Quark> {
        self.tree
            .lookup_quark(Some(base), path)?
            .ok_or_else(|| not_found(path))
    }

    pub fn opt_quark_relative<S: AsRef<str>>(&self, base: Quark, path: &[S]) -> Option<Quark> {
        self.tree.lookup_quark(Some(base), path).ok().flatten()
    }

    pub fn quark_relative_and_add<S: AsRef<str>>(&self, base: Quark, path: &[S]) -> Result<Quark> {
        self.tree.get_or_create_quark(Some(base), path)
    }

    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.tree.children(Some(quark), recursive)
    }

    pub fn parent_attribute(&self, quark: Quark) -> Result<Option<Quark>> {
        self.tree.parent_of(quark)
    }

    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        self.tree.name_of(quark)
    }

    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.tree.full_path(quark)
    }

    /// Quarks matching `pattern` under `base` (`None` = root). A `*` segment
    /// matches every child, `..` moves to the parent.
    pub fn quarks<S: AsRef<str>>(&self, base: Option<Quark>, pattern: &[S]) -> Result<Vec<Quark>> {
        let mut current = vec![base];
        for segment in pattern {
            let mut next = Vec::new();
            for node in current {
                match segment.as_ref() {
                    "*" => next.extend(self.tree.children(node, false)?.into_iter().map(Some)),
                    ".." => {
                        if let Some(q) = node {
                            next.push(self.tree.parent_of(q)?);
                        }
                    }
                    name => {
                        if let Some(q) = self.tree.lookup_quark(node, &[name])? {
                            next.push(Some(q));
                        }
                    }
                }
            }
            current = next;
        }
        Ok(current.into_iter().flatten().collect())
    }

    fn check_quark(&self, quark: Quark) -> Result<()> {
        if quark.is_valid() && self.tree.contains(quark) {
            Ok(())
        } else {
            Err(StateError::InvalidQuark(quark))
        }
    }

    fn check_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(StateError::Disposed)
        } else {
            Ok(())
        }
    }

    // --- Writes (pipeline worker only) ---

    /// `quark` holds `value` from `t` on.
    pub fn modify_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.check_quark(quark)?;
        self.transient
            .process_state_change(t, value, quark, self.backend.as_ref())
    }

    /// Nullify `quark` and its whole subtree at `t`, children first.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.check_quark(quark)?;
        for child in self.tree.children(Some(quark), false)? {
            self.remove_attribute(t, child)?;
        }
        self.modify_attribute(t, StateValue::Null, quark)
    }

    /// Store a closed interval directly, without going through the ongoing
    /// state. The attribute is null afterwards.
    pub fn insert_past_state(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        value: StateValue,
    ) -> Result<()> {
        self.check_quark(quark)?;
        self.transient
            .insert_past_state(quark, start, end, value, self.backend.as_ref())
    }

    /// Push `value` on the stack attribute `quark`.
    ///
    /// The depth is kept as an integer value on `quark`, elements live in the
    /// children `"1"`, `"2"`, ...
    pub fn push_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.check_quark(quark)?;
        let depth = self.stack_depth(quark)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::InvalidOperation(format!(
                "stack attribute {} exceeds the maximum depth of {}",
                quark, MAX_STACK_DEPTH
            )));
        }
        let depth = depth + 1;
        let element = self.quark_relative_and_add(quark, &[depth.to_string()])?;
        self.modify_attribute(t, StateValue::Int(depth), quark)?;
        self.modify_attribute(t, value, element)
    }

    /// Pop the top of the stack attribute `quark`. Popping an empty stack
    /// does nothing and returns `None`.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        self.check_quark(quark)?;
        let depth = self.stack_depth(quark)?;
        if depth == 0 {
            return Ok(None);
        }
        let element = self.quark_relative(quark, &[depth.to_string()])?;
        let popped = self.transient.value(element);

        let next = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, next, quark)?;
        self.remove_attribute(t, element)?;
        Ok(Some(popped))
    }

    fn stack_depth(&self, quark: Quark) -> Result<i32> {
        match self.transient.value(quark) {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) if (0..=MAX_STACK_DEPTH).contains(&depth) => Ok(depth),
            other => Err(StateError::InvalidOperation(format!(
                "attribute {} is not a stack (value {})",
                quark, other
            ))),
        }
    }

    /// Change the ongoing value of `quark` without creating an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_quark(quark)?;
        self.transient.update_ongoing(quark, value)
    }

    /// Replace the ongoing state with one interval per quark.
    pub(crate) fn load_ongoing(&self, intervals: &[Option<Interval>]) {
        self.transient.replace_ongoing(intervals);
    }

    // --- Lifecycle ---

    /// Flush the ongoing state, freeze the history at `end` (raised to the
    /// current end if lower) and release every waiter.
    pub fn close_history(&self, end: Timestamp) -> Result<()> {
        let end = end.max(self.current_end_time());
        let closed = self
            .transient
            .close(end, self.tree.len(), self.backend.as_ref())
            .and_then(|()| self.backend.finished_building(end, &self.tree));
        if let Err(e) = closed {
            self.abort();
            return Err(e);
        }

        *self.build_state.lock() = BuildState::Built;
        self.built.notify_all();
        info!(ssid = %self.ssid, end, attributes = self.tree.len(), "state history built");
        Ok(())
    }

    /// The build will never complete. Writes fail from now on and waiters
    /// are released.
    pub fn abort(&self) {
        let mut state = self.build_state.lock();
        if *state != BuildState::Building {
            return;
        }
        *state = BuildState::Aborted;
        self.transient.deactivate();
        self.backend.abort();
        self.built.notify_all();
        debug!(ssid = %self.ssid, "state history build aborted");
    }

    /// Block until the history is built. False if the build was aborted.
    pub fn wait_until_built(&self) -> bool {
        let mut state = self.build_state.lock();
        while *state == BuildState::Building {
            self.built.wait(&mut state);
        }
        *state == BuildState::Built
    }

    /// Like [`StateSystem::wait_until_built`], giving up after `timeout`.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.build_state.lock();
        while *state == BuildState::Building {
            if self.built.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state == BuildState::Built
    }

    pub fn is_built(&self) -> bool {
        *self.build_state.lock() == BuildState::Built
    }

    pub fn is_cancelled(&self) -> bool {
        *self.build_state.lock() == BuildState::Aborted
    }

    /// Release the backend. Every further query fails with `Disposed`.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort();
        self.backend.dispose();
        debug!(ssid = %self.ssid, "state system disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Delete the backend's on-disk artifact, if any.
    pub fn remove_files(&self) -> Result<()> {
        self.backend.remove_files()
    }

    // --- Queries ---

    /// Ongoing value of `quark`.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.check_not_disposed()?;
        self.check_quark(quark)?;
        Ok(self.transient.value(quark))
    }

    /// Start time of the ongoing interval of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        self.check_not_disposed()?;
        self.check_quark(quark)?;
        Ok(self.transient.start_of(quark))
    }

    fn check_range(&self, t: Timestamp) -> Result<()> {
        let start = self.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(StateError::TimeRange { time: t, start, end });
        }
        Ok(())
    }

    /// The interval of `quark` covering `t`.
    ///
    /// Still-ongoing intervals are reported with an end of
    /// `Timestamp::MAX`. A backend that keeps no history only answers at the
    /// current end time.
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<Interval> {
        self.check_not_disposed()?;
        self.check_quark(quark)?;
        self.check_range(t)?;

        if !self.backend.keeps_history() {
            return self.ongoing_snapshot_interval(t, quark);
        }
        if let Some(interval) = self.transient.interval_at(t, quark, Timestamp::MAX) {
            return Ok(interval);
        }
        self.backend
            .do_single_query(t, quark)?
            .ok_or_else(|| missing_interval(t, quark))
    }

    /// One interval per attribute, all covering `t`, indexed by quark.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<Interval>> {
        self.check_not_disposed()?;
        self.check_range(t)?;
        let nb = self.tree.len();

        if !self.backend.keeps_history() {
            return (0..nb)
                .map(|i| self.ongoing_snapshot_interval(t, Quark::from_index(i)))
                .collect();
        }

        let mut states = vec![None; nb];
        self.transient.do_query(&mut states, t, Timestamp::MAX);
        if states.iter().any(Option::is_none) {
            let mut stored = vec![None; nb];
            self.backend.do_query(&mut stored, t)?;
            for (slot, interval) in states.iter_mut().zip(stored) {
                if slot.is_none() {
                    *slot = interval;
                }
            }
        }

        states
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.ok_or_else(|| missing_interval(t, Quark::from_index(i))))
            .collect()
    }

    /// Every interval of `quark` intersecting `[start, end]`.
    ///
    /// The range is clamped to the store range. With `resolution > 0`,
    /// intervals may be skipped so that consecutive samples are at least
    /// `resolution` apart; the first interval is always the exact one at the
    /// start of the range.
    pub fn query_history_range(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        resolution: i64,
    ) -> Result<Vec<Interval>> {
        self.check_not_disposed()?;
        self.check_quark(quark)?;
        let store_start = self.start_time();
        let store_end = self.current_end_time();
        let t1 = start.max(store_start);
        let t2 = end.min(store_end);
        if t1 > t2 {
            return Err(StateError::TimeRange {
                time: if start > store_end { start } else { end },
                start: store_start,
                end: store_end,
            });
        }

        let mut intervals = Vec::new();
        let mut current = self.query_single_state(t1, quark)?;
        let mut t = t1;
        loop {
            let next = if resolution > 0 {
                ((current.end - t) / resolution)
                    .checked_add(1)
                    .and_then(|steps| steps.checked_mul(resolution))
                    .and_then(|step| t.checked_add(step))
            } else {
                current.end.checked_add(1)
            };
            intervals.push(current);
            match next {
                Some(n) if n <= t2 => {
                    t = n;
                    current = self.query_single_state(t, quark)?;
                }
                _ => break,
            }
        }

        if let Some(last) = intervals.last() {
            if last.end < t2 {
                intervals.push(self.query_single_state(t2, quark)?);
            }
        }
        Ok(intervals)
    }

    /// Ongoing value as seen by a backend without history.
    fn ongoing_snapshot_interval(&self, t: Timestamp, quark: Quark) -> Result<Interval> {
        if t != self.current_end_time() {
            return Err(StateError::NoHistory);
        }
        let end = if self.transient.is_active() {
            Timestamp::MAX
        } else {
            self.current_end_time()
        };
        Ok(self.transient.ongoing_interval(quark, end))
    }

    /// Full state at `t` where still-ongoing intervals end at `ongoing_end`.
    /// No range checks; used to read a scratch replay.
    pub(crate) fn snapshot_at(&self, t: Timestamp, ongoing_end: Timestamp) -> Result<Vec<Option<Interval>>> {
        let nb = self.tree.len();
        let mut states = vec![None; nb];
        self.transient.do_query(&mut states, t, ongoing_end);
        let mut stored = vec![None; nb];
        self.backend.do_query(&mut stored, t)?;
        for (slot, interval) in states.iter_mut().zip(stored) {
            if slot.is_none() {
                *slot = interval;
            }
        }
        Ok(states)
    }
}

fn not_found<S: AsRef<str>>(path: &[S]) -> StateError {
    let path: Vec<&str> = path.iter().map(|s| s.as_ref()).collect();
    StateError::AttributeNotFound(path.join("/"))
}

fn missing_interval(t: Timestamp, quark: Quark) -> StateError {
    StateError::InvalidOperation(format!("no interval stored for {} at {}", quark, t))
}

//! Partial history: checkpoints on disk, the rest re-simulated on query.
//!
//! Checkpoints are the store start plus the first event time at least
//! `granularity` after the previous checkpoint. Only intervals that contain a
//! checkpoint are written to the history file. A query at `t` reads the full
//! state at the checkpoint before `t`, then replays the events up to the next
//! checkpoint through a fresh provider instance on a scratch in-memory state
//! system.

use super::history_file::HistoryFileBackend;
use super::memory::InMemoryBackend;
use super::{IntervalTail, StateBackend};
use crate::attributes::AttributeTree;
use crate::error::{Result, StateError};
use crate::provider::{FutureEvents, ProviderContext, StateProvider};
use crate::source::{CancellationToken, EventSource};
use crate::statesystem::StateSystem;
use crate::types::{BackendType, Interval, Quark, StateValue, TimeRange, Timestamp};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Checkpoint list stored in the history file footer.
#[derive(Serialize, Deserialize)]
struct CheckpointFooter {
    granularity: i64,
    times: Vec<Timestamp>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuildState {
    Building,
    Built,
    Aborted,
}

/// Down-sampled on-disk history.
pub struct PartialHistoryBackend {
    ssid: String,
    inner: HistoryFileBackend,
    granularity: i64,
    checkpoints: RwLock<Vec<Timestamp>>,
    last_checkpoint: AtomicI64,
    end: AtomicI64,
    tail: IntervalTail,
    tree: Arc<AttributeTree>,
    source: Arc<dyn EventSource>,
    provider: Mutex<Box<dyn StateProvider>>,
    build_state: Mutex<BuildState>,
    built: Condvar,
    replay: Mutex<()>,
}

impl PartialHistoryBackend {
    /// Create a new partial history file at `path`.
    ///
    /// `tree` must be the attribute tree of the state system this backend is
    /// plugged into; replays resolve quarks through it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider: Box<dyn StateProvider>,
        source: Arc<dyn EventSource>,
        tree: Arc<AttributeTree>,
        start: Timestamp,
        granularity: i64,
        cache_size: usize,
    ) -> Result<Self> {
        if granularity <= 0 {
            return Err(StateError::InvalidOperation(format!(
                "partial history granularity must be positive, got {}",
                granularity
            )));
        }
        let ssid = ssid.into();
        let inner = HistoryFileBackend::create_as(
            BackendType::Partial,
            ssid.clone(),
            path,
            provider.version(),
            start,
            cache_size,
        )?;
        Ok(Self {
            ssid,
            inner,
            granularity,
            checkpoints: RwLock::new(vec![start]),
            last_checkpoint: AtomicI64::new(start),
            end: AtomicI64::new(start),
            tail: IntervalTail::new(start),
            tree,
            source,
            provider: Mutex::new(provider),
            build_state: Mutex::new(BuildState::Building),
            built: Condvar::new(),
            replay: Mutex::new(()),
        })
    }

    /// Reopen a complete partial history file.
    pub fn open(
        ssid: impl Into<String>,
        path: impl AsRef<Path>,
        provider: Box<dyn StateProvider>,
        source: Arc<dyn EventSource>,
        tree: Arc<AttributeTree>,
        cache_size: usize,
    ) -> Result<Self> {
        let ssid = ssid.into();
        let inner = HistoryFileBackend::open_as(
            BackendType::Partial,
            ssid.clone(),
            path,
            provider.version(),
            cache_size,
        )?;
        let footer: CheckpointFooter = rmp_serde::from_slice(&inner.extra())?;
        let start = inner.start_time();
        if footer.times.first() != Some(&start) {
            return Err(StateError::InvalidFormat(
                "partial history has no checkpoint at its start".into(),
            ));
        }

        let tail = IntervalTail::new(start);
        tail.close()?;
        let last = footer.times.last().copied().unwrap_or(start);
        let end = inner.end_time();
        Ok(Self {
            ssid,
            inner,
            granularity: footer.granularity,
            checkpoints: RwLock::new(footer.times),
            last_checkpoint: AtomicI64::new(last),
            end: AtomicI64::new(end),
            tail,
            tree,
            source,
            provider: Mutex::new(provider),
            build_state: Mutex::new(BuildState::Built),
            built: Condvar::new(),
            replay: Mutex::new(()),
        })
    }

    pub fn granularity(&self) -> i64 {
        self.granularity
    }

    pub fn checkpoints(&self) -> Vec<Timestamp> {
        self.checkpoints.read().clone()
    }

    /// Number of intervals actually written to disk.
    pub fn stored_interval_count(&self) -> usize {
        self.inner.interval_count()
    }

    /// Checkpoint at or before `t`, and the one after it.
    fn surrounding_checkpoints(&self, t: Timestamp) -> Option<(Timestamp, Option<Timestamp>)> {
        let checkpoints = self.checkpoints.read();
        let index = checkpoints.partition_point(|&c| c <= t);
        if index == 0 {
            return None;
        }
        Some((checkpoints[index - 1], checkpoints.get(index).copied()))
    }

    fn wait_until_built(&self) -> Result<()> {
        let mut state = self.build_state.lock();
        while *state == BuildState::Building {
            self.built.wait(&mut state);
        }
        match *state {
            BuildState::Built => Ok(()),
            _ => Err(StateError::Cancelled),
        }
    }

    fn set_build_state(&self, state: BuildState) {
        let mut current = self.build_state.lock();
        if *current == BuildState::Building {
            *current = state;
        }
        self.built.notify_all();
    }

    /// Re-simulate `(cp1, until]` from the full state at `cp1` and return the
    /// state at `t`. Intervals still open at the end of the replay are
    /// reported with an end of `Timestamp::MAX`.
    fn replay(
        &self,
        at_cp1: &[Option<Interval>],
        cp1: Timestamp,
        until: Timestamp,
        t: Timestamp,
    ) -> Result<Vec<Option<Interval>>> {
        let _guard = self.replay.lock();
        trace!(ssid = %self.ssid, cp1, until, t, "partial history replay");

        let scratch = StateSystem::with_tree(
            Arc::clone(&self.tree),
            Box::new(InMemoryBackend::new(self.ssid.clone(), self.start_time())),
        );
        scratch.load_ongoing(at_cp1);

        let mut provider = self.provider.lock().new_instance();
        let mut future = FutureEvents::new();
        let mut failure = None;
        self.source.request(
            TimeRange::new(cp1.saturating_add(1), until),
            0,
            &CancellationToken::new(),
            &mut |event| {
                scratch.advance_time(event.timestamp);
                let handled = future.apply_until(event.timestamp, &scratch).and_then(|()| {
                    let mut ctx = ProviderContext::new(&scratch, &mut future);
                    provider.event_handle(event, &mut ctx)
                });
                match handled {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        failure = Some(e);
                        ControlFlow::Break(())
                    }
                }
            },
        )?;
        if let Some(e) = failure {
            return Err(e);
        }

        let mut states = scratch.snapshot_at(t, Timestamp::MAX)?;
        states.resize(at_cp1.len(), None);
        Ok(states)
    }
}

impl StateBackend for PartialHistoryBackend {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Partial
    }

    fn start_time(&self) -> Timestamp {
        self.inner.start_time()
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
        self.end.fetch_max(end, Ordering::SeqCst);

        let crosses_checkpoint = self
            .surrounding_checkpoints(end)
            .is_some_and(|(floor, _)| floor >= start);
        if crosses_checkpoint {
            self.inner.insert_past_state(start, end, quark, value)?;
        }
        Ok(())
    }

    fn finished_building(&self, end: Timestamp, tree: &AttributeTree) -> Result<()> {
        self.tail.close()?;
        self.end.fetch_max(end, Ordering::SeqCst);

        let footer = CheckpointFooter {
            granularity: self.granularity,
            times: self.checkpoints(),
        };
        self.inner.set_extra(rmp_serde::to_vec(&footer)?);
        self.inner.finished_building(end, tree)?;
        self.set_build_state(BuildState::Built);

        debug!(
            ssid = %self.ssid,
            checkpoints = footer.times.len(),
            stored = self.inner.interval_count(),
            "partial history completed"
        );
        Ok(())
    }

    fn attribute_tree(&self) -> Option<Vec<u8>> {
        self.inner.attribute_tree()
    }

    fn is_complete(&self) -> bool {
        self.inner.is_complete()
    }

    fn advance_time(&self, t: Timestamp) {
        let last = self.last_checkpoint.load(Ordering::SeqCst);
        if t >= last.saturating_add(self.granularity) {
            self.checkpoints.write().push(t);
            self.last_checkpoint.store(t, Ordering::SeqCst);
        }
    }

    fn do_query(&self, states: &mut [Option<Interval>], t: Timestamp) -> Result<()> {
        self.wait_until_built()?;
        let Some((cp1, cp2)) = self.surrounding_checkpoints(t) else {
            return Ok(());
        };

        let mut at_cp1 = vec![None; states.len()];
        self.inner.do_query(&mut at_cp1, cp1)?;
        if cp1 == t {
            for (slot, interval) in states.iter_mut().zip(at_cp1) {
                if interval.is_some() {
                    *slot = interval;
                }
            }
            return Ok(());
        }

        let until = cp2.unwrap_or_else(|| self.end_time());
        let replayed = self.replay(&at_cp1, cp1, until, t)?;

        let nb_attributes = states.len();
        let mut at_cp2: Option<Vec<Option<Interval>>> = None;
        for (index, slot) in states.iter_mut().enumerate() {
            if let Some(interval) = at_cp1[index].as_ref().filter(|i| i.intersects(t)) {
                *slot = Some(interval.clone());
                continue;
            }
            let Some(interval) = replayed[index].as_ref().filter(|i| i.intersects(t)) else {
                continue;
            };
            if !interval.is_ongoing() {
                *slot = Some(interval.clone());
                continue;
            }
            // Still open after the replay: the interval reaches the next
            // checkpoint, where it is stored in full.
            match cp2 {
                Some(cp2) => {
                    if at_cp2.is_none() {
                        let mut full = vec![None; nb_attributes];
                        self.inner.do_query(&mut full, cp2)?;
                        at_cp2 = Some(full);
                    }
                    let stored = at_cp2
                        .as_ref()
                        .and_then(|full| full[index].as_ref())
                        .filter(|i| i.intersects(t));
                    if let Some(stored) = stored {
                        *slot = Some(stored.clone());
                    }
                }
                None => {
                    *slot = Some(Interval::new(
                        interval.quark,
                        interval.start,
                        self.end_time(),
                        interval.value.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn do_single_query(&self, t: Timestamp, quark: Quark) -> Result<Option<Interval>> {
        self.wait_until_built()?;
        let Some((cp1, _)) = self.surrounding_checkpoints(t) else {
            return Ok(None);
        };
        if let Some(interval) = self.inner.do_single_query(cp1, quark)? {
            if interval.intersects(t) {
                return Ok(Some(interval));
            }
        }

        let nb = self.tree.len().max(quark.index() + 1);
        let mut states = vec![None; nb];
        self.do_query(&mut states, t)?;
        Ok(states.swap_remove(quark.index()))
    }

    fn file_path(&self) -> Option<&Path> {
        self.inner.file_path()
    }

    fn file_size(&self) -> Option<u64> {
        self.inner.file_size()
    }

    fn remove_files(&self) -> Result<()> {
        self.inner.remove_files()
    }

    fn abort(&self) {
        self.set_build_state(BuildState::Aborted);
    }

    fn dispose(&self) {
        self.abort();
        self.inner.dispose();
    }
}

//! Upstream event sources.

use crate::error::{Result, StateError};
use crate::types::{TimeRange, Timestamp, TraceEvent};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a requester and a source.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a request ended, with the number of events delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed { read: u64 },
    Cancelled { read: u64 },
}

impl RequestOutcome {
    pub fn read(&self) -> u64 {
        match self {
            RequestOutcome::Completed { read } | RequestOutcome::Cancelled { read } => *read,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestOutcome::Cancelled { .. })
    }
}

/// Delivers trace events in non-decreasing timestamp order.
pub trait EventSource: Send + Sync {
    /// Timestamp of the first event.
    fn start_time(&self) -> Timestamp;

    /// Timestamp of the last event known so far.
    fn end_time(&self) -> Timestamp;

    /// Whether no more events will ever be added.
    fn is_complete(&self) -> bool;

    /// Deliver the events whose timestamp lies in `range`, skipping the first
    /// `skip` of them, until the source is exhausted, `cancel` is set, or
    /// `sink` breaks. The outcome is reported once, as the return value.
    fn request(
        &self,
        range: TimeRange,
        skip: u64,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(&TraceEvent) -> ControlFlow<()>,
    ) -> Result<RequestOutcome>;
}

/// In-memory event source that may keep growing.
#[derive(Default)]
pub struct VecEventSource {
    events: RwLock<Vec<TraceEvent>>,
    start: Option<Timestamp>,
    complete: AtomicBool,
}

impl VecEventSource {
    /// Empty, incomplete source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty, incomplete source whose range starts at `start`.
    pub fn with_start(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            ..Self::default()
        }
    }

    /// Complete source holding `events`.
    pub fn from_events(events: impl IntoIterator<Item = TraceEvent>) -> Result<Self> {
        let source = Self::new();
        for event in events {
            source.push(event)?;
        }
        source.mark_complete();
        Ok(source)
    }

    /// Append one event. Its timestamp must not be before the last one.
    pub fn push(&self, event: TraceEvent) -> Result<()> {
        if self.is_complete() {
            return Err(StateError::InvalidOperation(
                "event source is complete".to_string(),
            ));
        }
        let mut events = self.events.write();
        let floor = events
            .last()
            .map(|e| e.timestamp)
            .or(self.start)
            .unwrap_or(Timestamp::MIN);
        if event.timestamp < floor {
            return Err(StateError::InvalidOperation(format!(
                "event at {} is before {}",
                event.timestamp, floor
            )));
        }
        events.push(event);
        Ok(())
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for VecEventSource {
    fn start_time(&self) -> Timestamp {
        self.start
            .or_else(|| self.events.read().first().map(|e| e.timestamp))
            .unwrap_or(0)
    }

    fn end_time(&self) -> Timestamp {
        self.events
            .read()
            .last()
            .map(|e| e.timestamp)
            .unwrap_or_else(|| self.start_time())
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn request(
        &self,
        range: TimeRange,
        skip: u64,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(&TraceEvent) -> ControlFlow<()>,
    ) -> Result<RequestOutcome> {
        let mut position = {
            let events = self.events.read();
            events.partition_point(|e| e.timestamp < range.start)
        };
        let mut skipped = 0u64;
        let mut read = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Ok(RequestOutcome::Cancelled { read });
            }
            // The lock is not held while the sink runs, so the source can
            // keep growing under a blocked consumer.
            let event = match self.events.read().get(position) {
                Some(e) if range.contains(e.timestamp) => e.clone(),
                _ => break,
            };
            position += 1;

            if skipped < skip {
                skipped += 1;
                continue;
            }
            read += 1;
            if sink(&event).is_break() {
                return Ok(RequestOutcome::Cancelled { read });
            }
        }

        Ok(RequestOutcome::Completed { read })
    }
}

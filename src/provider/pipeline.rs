//! Bounded producer/consumer pipeline feeding a provider on its own thread.

use super::context::{FutureEvents, ProviderContext};
use super::state_provider::StateProvider;
use crate::error::{Result, StateError};
use crate::statesystem::StateSystem;
use crate::types::{Timestamp, TraceEvent};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Default capacity of the event queue.
pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// Lifecycle of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    /// No target state system yet; events are rejected.
    Unbound,
    /// The worker applies events as they arrive.
    Running,
    /// The end marker is queued; the worker drains what is left.
    Draining,
    /// The worker has stopped.
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Unbound => "unbound",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Closed => "closed",
        };
        f.write_str(name)
    }
}

enum Message {
    Event(TraceEvent),
    /// Barrier: acknowledged once everything queued before it is applied.
    Flush(Sender<()>),
    End,
}

/// State shared with the worker thread.
struct Shared {
    safe_time: AtomicI64,
    cancelled: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Shared {
    fn fail(&self, message: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.failure.lock().is_some()
    }
}

/// Feeds events to a [`StateProvider`] running on a dedicated worker thread.
///
/// The producer blocks when the queue is full. The worker is the only writer
/// of the target state system; on the end marker it closes the history at
/// the timestamp of the last event.
pub struct ProviderPipeline {
    id: String,
    version: u32,
    state: Mutex<PipelineState>,
    sender: Sender<Message>,
    receiver: Mutex<Option<Receiver<Message>>>,
    provider: Mutex<Option<Box<dyn StateProvider>>>,
    target: Mutex<Option<Arc<StateSystem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl ProviderPipeline {
    /// Wrap `provider` with a queue of `queue_size` events.
    pub fn new(provider: Box<dyn StateProvider>, queue_size: usize) -> Self {
        let (sender, receiver) = bounded(queue_size.max(1));
        Self {
            id: provider.id().to_string(),
            version: provider.version(),
            state: Mutex::new(PipelineState::Unbound),
            sender,
            receiver: Mutex::new(Some(receiver)),
            provider: Mutex::new(Some(provider)),
            target: Mutex::new(None),
            worker: Mutex::new(None),
            shared: Arc::new(Shared {
                safe_time: AtomicI64::new(Timestamp::MIN),
                cancelled: AtomicBool::new(false),
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Version declared by the provider.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// The assigned state system, if any.
    pub fn state_system(&self) -> Option<Arc<StateSystem>> {
        self.target.lock().clone()
    }

    /// Bind the provider to `ss` and start the worker thread.
    pub fn assign_target(&self, ss: Arc<StateSystem>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != PipelineState::Unbound {
            return Err(StateError::ProviderAlreadyAssigned);
        }
        let (provider, receiver) = match (self.provider.lock().take(), self.receiver.lock().take()) {
            (Some(p), Some(r)) => (p, r),
            _ => return Err(StateError::ProviderAlreadyAssigned),
        };

        self.shared
            .safe_time
            .store(ss.start_time().saturating_sub(1), Ordering::SeqCst);
        *self.target.lock() = Some(Arc::clone(&ss));

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{} Event Handler", self.id))
            .spawn(move || run_worker(provider, receiver, ss, shared))?;
        *self.worker.lock() = Some(handle);
        *state = PipelineState::Running;

        debug!(provider = %self.id, "pipeline started");
        Ok(())
    }

    /// Queue one event, blocking while the queue is full.
    pub fn process_event(&self, event: TraceEvent) -> Result<()> {
        match self.state() {
            PipelineState::Unbound => {
                error!(
                    provider = %self.id,
                    time = event.timestamp,
                    "event received before a target state system was assigned"
                );
                return Err(StateError::ProviderNotAssigned);
            }
            PipelineState::Draining | PipelineState::Closed => {
                return Err(StateError::PipelineClosed);
            }
            PipelineState::Running => {}
        }
        if let Some(message) = self.shared.failure() {
            return Err(StateError::BuildFailed(message));
        }
        if self.shared.cancelled.load(Ordering::SeqCst) {
            return Err(StateError::Cancelled);
        }
        self.sender
            .send(Message::Event(event))
            .map_err(|_| StateError::PipelineClosed)
    }

    /// Block until every event queued so far has been applied.
    pub fn wait_for_empty_queue(&self) -> Result<()> {
        if self.state() != PipelineState::Running {
            return Ok(());
        }
        let (ack, done) = bounded(1);
        self.sender
            .send(Message::Flush(ack))
            .map_err(|_| StateError::PipelineClosed)?;
        done.recv().map_err(|_| StateError::PipelineClosed)
    }

    /// Stop applying events. The worker keeps draining the queue and does
    /// not close the history.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::SeqCst) {
            info!(provider = %self.id, "pipeline cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Failure recorded by the worker, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure()
    }

    /// Latest time up to which queries are guaranteed to be complete.
    pub fn latest_safe_time(&self) -> Timestamp {
        self.shared.safe_time.load(Ordering::SeqCst)
    }

    /// Queue the end marker and wait for the worker to finish.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                PipelineState::Unbound => {
                    *state = PipelineState::Closed;
                    return;
                }
                PipelineState::Running => *state = PipelineState::Draining,
                PipelineState::Draining | PipelineState::Closed => return,
            }
        }

        let _ = self.sender.send(Message::End);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                self.shared.fail("event handler thread panicked".to_string());
                if let Some(ss) = self.target.lock().as_ref() {
                    ss.abort();
                }
            }
        }
        *self.state.lock() = PipelineState::Closed;
        debug!(provider = %self.id, "pipeline closed");
    }
}

fn run_worker(
    mut provider: Box<dyn StateProvider>,
    receiver: Receiver<Message>,
    ss: Arc<StateSystem>,
    shared: Arc<Shared>,
) {
    let mut future = FutureEvents::new();
    let mut last_time: Option<Timestamp> = None;

    loop {
        match receiver.recv() {
            Ok(Message::Event(event)) => {
                if shared.is_stopped() {
                    continue;
                }
                let t = event.timestamp;
                shared.safe_time.store(t.saturating_sub(1), Ordering::SeqCst);
                ss.advance_time(t);
                last_time = Some(t);

                let handled = future.apply_until(t, &ss).and_then(|()| {
                    let mut ctx = ProviderContext::new(&ss, &mut future);
                    provider.event_handle(&event, &mut ctx)
                });
                if let Err(e) = handled {
                    error!(provider = %provider.id(), time = t, error = %e, "state provider failed");
                    shared.fail(e.to_string());
                }
            }
            Ok(Message::Flush(ack)) => {
                let _ = ack.send(());
            }
            Ok(Message::End) => break,
            Err(_) => {
                shared.fail("event queue disconnected".to_string());
                break;
            }
        }
    }

    if !shared.is_stopped() {
        let end = last_time.unwrap_or_else(|| ss.start_time());
        let finished = future
            .apply_all(&ss)
            .and_then(|()| {
                let mut ctx = ProviderContext::new(&ss, &mut future);
                provider.done(&mut ctx)
            })
            .and_then(|()| ss.close_history(end));
        if let Err(e) = finished {
            error!(provider = %provider.id(), error = %e, "could not close state history");
            shared.fail(e.to_string());
        }
    }

    if shared.is_stopped() {
        ss.abort();
    }
}

//! State system module: picks a backend, reopens or builds the history, and
//! exposes the state system to queries while it is being built.

use super::config::ModuleConfig;
use super::notify::{ModuleEvent, ModuleNotifier, Subscription};
use crate::attributes::AttributeTree;
use crate::backend::{HistoryFileBackend, InMemoryBackend, NullBackend, PartialHistoryBackend};
use crate::error::{Result, StateError};
use crate::provider::{ProviderPipeline, StateProvider};
use crate::source::{CancellationToken, EventSource};
use crate::statesystem::StateSystem;
use crate::types::{BackendType, TimeRange};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long the build loop waits for new events from an incomplete source
/// before polling it again.
const RANGE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Creates a fresh provider for each build.
pub type ProviderFactory = Arc<dyn Fn() -> Box<dyn StateProvider> + Send + Sync>;

/// Lifecycle of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Not started.
    Created,
    /// Opening or creating the backend.
    Building,
    /// Queries are allowed; the history may still be growing.
    Ready,
    /// The history is built and closed.
    Completed,
    Failed,
    Cancelled,
}

impl ModuleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ModuleStatus::Completed | ModuleStatus::Failed | ModuleStatus::Cancelled
        )
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleStatus::Created => "created",
            ModuleStatus::Building => "building",
            ModuleStatus::Ready => "ready",
            ModuleStatus::Completed => "completed",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct Progress {
    status: ModuleStatus,
    /// Set once: whether a state system became available.
    initialized: Option<bool>,
}

enum Prepared {
    Reopened(Arc<StateSystem>),
    Fresh(Arc<StateSystem>, Arc<ProviderPipeline>),
}

/// Builds one state system from an event source.
pub struct StateSystemModule {
    config: ModuleConfig,
    factory: ProviderFactory,
    source: Arc<dyn EventSource>,
    progress: Mutex<Progress>,
    progress_changed: Condvar,
    state_system: RwLock<Option<Arc<StateSystem>>>,
    pipeline: Mutex<Option<Arc<ProviderPipeline>>>,
    cancel: CancellationToken,
    range_updated: Mutex<bool>,
    range_changed: Condvar,
    nb_read: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    notifier: ModuleNotifier,
}

impl StateSystemModule {
    pub fn new(
        config: ModuleConfig,
        factory: ProviderFactory,
        source: Arc<dyn EventSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            factory,
            source,
            progress: Mutex::new(Progress {
                status: ModuleStatus::Created,
                initialized: None,
            }),
            progress_changed: Condvar::new(),
            state_system: RwLock::new(None),
            pipeline: Mutex::new(None),
            cancel: CancellationToken::new(),
            range_updated: Mutex::new(false),
            range_changed: Condvar::new(),
            nb_read: AtomicU64::new(0),
            worker: Mutex::new(None),
            notifier: ModuleNotifier::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn status(&self) -> ModuleStatus {
        self.progress.lock().status
    }

    /// Number of events read from the source so far.
    pub fn events_read(&self) -> u64 {
        self.nb_read.load(Ordering::SeqCst)
    }

    /// Receive the module's notifications.
    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe(self.config.listener_buffer)
    }

    /// Run the build on a dedicated thread.
    pub fn schedule(self: &Arc<Self>) -> Result<()> {
        self.begin()?;
        let module = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{} Build", self.config.id))
            .spawn(move || {
                // The outcome is recorded in the module status.
                let _ = module.run();
            });
        match handle {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.finish_early(ModuleStatus::Failed, ModuleEvent::Failed(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Run the build on the calling thread. Returns the terminal status:
    /// `Completed` or `Cancelled`. Failures are returned as errors.
    pub fn execute(&self) -> Result<ModuleStatus> {
        self.begin()?;
        self.run()
    }

    /// Block until the state system is available or the module failed before
    /// providing one. The module must have been started.
    pub fn wait_for_initialization(&self) -> bool {
        let mut progress = self.progress.lock();
        loop {
            if let Some(initialized) = progress.initialized {
                return initialized;
            }
            self.progress_changed.wait(&mut progress);
        }
    }

    /// Block until the build reaches a terminal status. Returns immediately
    /// on a module that was never started.
    pub fn wait_for_completion(&self) -> ModuleStatus {
        let status = {
            let mut progress = self.progress.lock();
            while progress.status != ModuleStatus::Created && !progress.status.is_terminal() {
                self.progress_changed.wait(&mut progress);
            }
            progress.status
        };
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(module = %self.config.id, "build thread panicked");
            }
        }
        status
    }

    /// The state system, unless the module failed or was cancelled.
    pub fn state_system(&self) -> Option<Arc<StateSystem>> {
        match self.status() {
            ModuleStatus::Failed | ModuleStatus::Cancelled => None,
            _ => self.state_system.read().clone(),
        }
    }

    /// The state system, scheduling the module and waiting for its
    /// initialization when it has not been started yet.
    pub fn state_system_or_schedule(self: &Arc<Self>) -> Option<Arc<StateSystem>> {
        if self.status() == ModuleStatus::Created {
            // Losing a race with another caller is fine, both then wait.
            let _ = self.schedule();
        }
        if self.wait_for_initialization() {
            self.state_system()
        } else {
            None
        }
    }

    /// Tell a module reading an incomplete source that new events are
    /// available.
    pub fn trace_range_updated(&self) {
        *self.range_updated.lock() = true;
        self.range_changed.notify_all();
    }

    /// Stop the build. The history file of an incomplete build is deleted; a
    /// completed one is kept.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(pipeline) = self.pipeline.lock().as_ref() {
            pipeline.cancel();
        }
        let not_started = {
            let mut progress = self.progress.lock();
            if progress.status == ModuleStatus::Created {
                progress.status = ModuleStatus::Cancelled;
                progress.initialized = Some(false);
                true
            } else {
                false
            }
        };
        if not_started {
            self.progress_changed.notify_all();
            self.notifier.broadcast(ModuleEvent::Cancelled);
        }
        self.trace_range_updated();
        info!(module = %self.config.id, "module cancelled");
    }

    /// Cancel a running build, wait for it, and release the state system.
    pub fn dispose(&self) {
        if !self.status().is_terminal() {
            self.cancel();
        }
        self.wait_for_completion();
        if let Some(ss) = self.state_system.write().take() {
            ss.dispose();
        }
    }

    /// Diagnostic properties: backend name and, for on-disk backends, the
    /// history file size.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert("Backend".to_string(), self.config.backend.name().to_string());
        if self.config.backend.is_on_disk() {
            let size = match fs::metadata(self.config.history_path()) {
                Ok(metadata) => format_size(metadata.len()),
                Err(_) => "Analysis not executed".to_string(),
            };
            properties.insert("File size".to_string(), size);
        }
        properties
    }

    // --- Build ---

    fn begin(&self) -> Result<()> {
        let mut progress = self.progress.lock();
        match progress.status {
            ModuleStatus::Created => {
                progress.status = ModuleStatus::Building;
                drop(progress);
                self.progress_changed.notify_all();
                info!(module = %self.config.id, backend = %self.config.backend.name(), "module building");
                Ok(())
            }
            ModuleStatus::Cancelled => Err(StateError::Cancelled),
            status => Err(StateError::InvalidOperation(format!(
                "module {} is already {}",
                self.config.id, status
            ))),
        }
    }

    fn run(&self) -> Result<ModuleStatus> {
        let prepared = match self.prepare() {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(module = %self.config.id, error = %e, "could not set up the state history");
                self.finish_early(ModuleStatus::Failed, ModuleEvent::Failed(e.to_string()));
                return Err(e);
            }
        };

        let (ss, pipeline) = match prepared {
            Prepared::Reopened(ss) => {
                *self.state_system.write() = Some(ss);
                self.set_initialized();
                self.set_status(ModuleStatus::Completed);
                self.notifier.broadcast(ModuleEvent::Completed);
                return Ok(ModuleStatus::Completed);
            }
            Prepared::Fresh(ss, pipeline) => (ss, pipeline),
        };

        *self.state_system.write() = Some(Arc::clone(&ss));
        *self.pipeline.lock() = Some(Arc::clone(&pipeline));
        if self.cancel.is_cancelled() {
            pipeline.cancel();
        }
        self.set_initialized();

        let source_error = self.feed(&pipeline).err();
        if source_error.is_some() {
            pipeline.cancel();
        }
        pipeline.dispose();
        self.finish(&ss, &pipeline, source_error)
    }

    fn prepare(&self) -> Result<Prepared> {
        let provider = (self.factory)();
        let id = self.config.id.clone();
        let start = self.source.start_time();
        let path = self.config.history_path();
        let cache_size = self.config.read_cache_size;

        if self.config.backend.is_on_disk() {
            fs::create_dir_all(&self.config.directory)?;
            if path.exists() {
                match self.reopen(&path, provider.as_ref()) {
                    Ok(ss) => {
                        info!(module = %id, path = %path.display(), "reopened existing state history");
                        return Ok(Prepared::Reopened(Arc::new(ss)));
                    }
                    Err(e) if is_stale(&e) => {
                        info!(module = %id, reason = %e, "existing state history rejected, rebuilding");
                        remove_file_if_exists(&path)?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let ss = match self.config.backend {
            BackendType::Full => {
                let backend =
                    HistoryFileBackend::create(id, &path, provider.version(), start, cache_size)?;
                StateSystem::new(Box::new(backend))
            }
            BackendType::Partial => {
                let tree = Arc::new(AttributeTree::new());
                let backend = PartialHistoryBackend::create(
                    id,
                    &path,
                    provider.new_instance(),
                    Arc::clone(&self.source),
                    Arc::clone(&tree),
                    start,
                    self.config.partial_granularity,
                    cache_size,
                )?;
                StateSystem::with_tree(tree, Box::new(backend))
            }
            BackendType::InMemory => StateSystem::new(Box::new(InMemoryBackend::new(id, start))),
            BackendType::Null => StateSystem::new(Box::new(NullBackend::new(id, start))),
        };

        let ss = Arc::new(ss);
        let pipeline = Arc::new(ProviderPipeline::new(provider, self.config.queue_size));
        pipeline.assign_target(Arc::clone(&ss))?;
        Ok(Prepared::Fresh(ss, pipeline))
    }

    fn reopen(&self, path: &Path, provider: &dyn StateProvider) -> Result<StateSystem> {
        let id = self.config.id.clone();
        let cache_size = self.config.read_cache_size;
        match self.config.backend {
            BackendType::Partial => {
                let tree = Arc::new(AttributeTree::new());
                let backend = PartialHistoryBackend::open(
                    id,
                    path,
                    provider.new_instance(),
                    Arc::clone(&self.source),
                    Arc::clone(&tree),
                    cache_size,
                )?;
                StateSystem::open_existing_with_tree(tree, Box::new(backend))
            }
            _ => {
                let backend = HistoryFileBackend::open(id, path, provider.version(), cache_size)?;
                StateSystem::open_existing(Box::new(backend))
            }
        }
    }

    /// Deliver events to the pipeline until the source is complete and
    /// exhausted, or the build stops. A failed pipeline ends the build even
    /// while the source is still growing.
    fn feed(&self, pipeline: &ProviderPipeline) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(message) = pipeline.failure() {
                return Err(StateError::BuildFailed(message));
            }
            let complete = self.source.is_complete();
            let skip = self.nb_read.load(Ordering::SeqCst);

            let mut rejected = None;
            let outcome = self.source.request(
                TimeRange::eternity(),
                skip,
                &self.cancel,
                &mut |event| match pipeline.process_event(event.clone()) {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => {
                        rejected = Some(e);
                        ControlFlow::Break(())
                    }
                },
            )?;
            self.nb_read.fetch_add(outcome.read(), Ordering::SeqCst);

            if let Some(message) = pipeline.failure() {
                return Err(StateError::BuildFailed(message));
            }
            match rejected {
                Some(StateError::Cancelled) | None => {}
                Some(e) => return Err(e),
            }
            if outcome.is_cancelled() || complete {
                return Ok(());
            }
            if skip > 0 && outcome.read() > 0 {
                debug!(module = %self.config.id, read = outcome.read(), "read new events");
                self.notifier.broadcast(ModuleEvent::RangeUpdated);
            }

            let mut updated = self.range_updated.lock();
            if !*updated {
                self.range_changed.wait_for(&mut updated, RANGE_POLL_INTERVAL);
            }
            *updated = false;
        }
    }

    fn finish(
        &self,
        ss: &StateSystem,
        pipeline: &ProviderPipeline,
        source_error: Option<StateError>,
    ) -> Result<ModuleStatus> {
        if ss.is_built() {
            self.set_status(ModuleStatus::Completed);
            self.notifier.broadcast(ModuleEvent::Completed);
            return Ok(ModuleStatus::Completed);
        }

        ss.dispose();
        if let Err(e) = ss.remove_files() {
            warn!(module = %self.config.id, error = %e, "could not delete incomplete state history");
        }

        let failure = source_error
            .map(|e| match e {
                StateError::BuildFailed(message) => message,
                e => e.to_string(),
            })
            .or_else(|| pipeline.failure());
        match failure {
            Some(message) => {
                error!(module = %self.config.id, error = %message, "state history build failed");
                self.set_status(ModuleStatus::Failed);
                self.notifier.broadcast(ModuleEvent::Failed(message.clone()));
                Err(StateError::BuildFailed(message))
            }
            None => {
                self.set_status(ModuleStatus::Cancelled);
                self.notifier.broadcast(ModuleEvent::Cancelled);
                Ok(ModuleStatus::Cancelled)
            }
        }
    }

    /// Terminal status reached before a state system was available.
    fn finish_early(&self, status: ModuleStatus, event: ModuleEvent) {
        {
            let mut progress = self.progress.lock();
            progress.status = status;
            if progress.initialized.is_none() {
                progress.initialized = Some(false);
            }
        }
        self.progress_changed.notify_all();
        self.notifier.broadcast(event);
        info!(module = %self.config.id, %status, "module state changed");
    }

    fn set_initialized(&self) {
        {
            let mut progress = self.progress.lock();
            progress.status = ModuleStatus::Ready;
            progress.initialized = Some(true);
        }
        self.progress_changed.notify_all();
        self.notifier.broadcast(ModuleEvent::Ready);
        info!(module = %self.config.id, "state system ready");
    }

    fn set_status(&self, status: ModuleStatus) {
        self.progress.lock().status = status;
        self.progress_changed.notify_all();
        info!(module = %self.config.id, %status, "module state changed");
    }
}

/// Errors meaning an existing file cannot be reused but may be replaced.
fn is_stale(e: &StateError) -> bool {
    matches!(
        e,
        StateError::VersionMismatch { .. }
            | StateError::InvalidFormat(_)
            | StateError::ChecksumMismatch { .. }
            | StateError::Deserialization(_)
    )
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::AttributeValueProvider;
    use crate::source::VecEventSource;
    use crate::types::{StateValue, TraceEvent};
    use tempfile::TempDir;

    fn factory(version: u32) -> ProviderFactory {
        Arc::new(move || Box::new(AttributeValueProvider::new("test", version)) as Box<dyn StateProvider>)
    }

    fn source() -> Arc<dyn EventSource> {
        let events = vec![
            TraceEvent::new(0, &["A"], 1),
            TraceEvent::new(10, &["A"], 2),
            TraceEvent::new(20, &["A"], StateValue::Null),
            TraceEvent::new(30, &["B"], 7),
        ];
        Arc::new(VecEventSource::from_events(events).unwrap())
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_execute_in_memory() {
        let config = ModuleConfig::new("test").with_backend(BackendType::InMemory);
        let module = StateSystemModule::new(config, factory(1), source());
        let sub = module.subscribe();

        assert_eq!(module.execute().unwrap(), ModuleStatus::Completed);
        assert!(module.wait_for_initialization());

        let ss = module.state_system().unwrap();
        let a = ss.quark_absolute(&["A"]).unwrap();
        assert_eq!(ss.query_single_state(5, a).unwrap().value, StateValue::Int(1));
        assert_eq!(module.events_read(), 4);

        assert_eq!(sub.receiver.try_recv().unwrap(), ModuleEvent::Ready);
        assert_eq!(sub.receiver.try_recv().unwrap(), ModuleEvent::Completed);
        assert_eq!(module.properties().get("Backend").unwrap(), "INMEM");
        assert!(module.properties().get("File size").is_none());
    }

    #[test]
    fn test_execute_twice() {
        let config = ModuleConfig::new("test").with_backend(BackendType::Null);
        let module = StateSystemModule::new(config, factory(1), source());
        module.execute().unwrap();
        assert!(matches!(module.execute(), Err(StateError::InvalidOperation(_))));
    }

    #[test]
    fn test_stale_file_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let config = ModuleConfig::new("test").with_directory(dir.path());

        let first = StateSystemModule::new(config.clone(), factory(1), source());
        first.execute().unwrap();
        first.dispose();

        let second = StateSystemModule::new(config.clone(), factory(2), source());
        assert_eq!(second.execute().unwrap(), ModuleStatus::Completed);
        // Built from events again: the ongoing state saw the source.
        assert_eq!(second.events_read(), 4);
        second.dispose();

        let third = StateSystemModule::new(config, factory(2), source());
        third.execute().unwrap();
        assert_eq!(third.events_read(), 0);
    }

    #[test]
    fn test_cancel_before_start() {
        let config = ModuleConfig::new("test").with_backend(BackendType::InMemory);
        let module = StateSystemModule::new(config, factory(1), source());
        module.cancel();

        assert_eq!(module.status(), ModuleStatus::Cancelled);
        assert!(!module.wait_for_initialization());
        assert!(matches!(module.execute(), Err(StateError::Cancelled)));
        assert!(module.state_system().is_none());
    }
}

//! # State History
//!
//! A time-indexed store of attribute values built from an ordered stream of
//! trace events, answering "what was the value of X at time t" queries.
//!
//! ## Core Concepts
//!
//! - **Attributes**: Hierarchical names (`CPUs/0/Status`) mapped to quarks
//! - **Intervals**: `[start, end]` ranges during which an attribute held a value
//! - **Backends**: Full (on disk), Partial (checkpoints on disk), InMemory, Null
//! - **Providers**: Turn events into state changes on a dedicated worker thread
//! - **Modules**: Reopen or build a history and expose it while it grows
//!
//! ## Example
//!
//! ```ignore
//! use statehistory::{
//!     AttributeValueProvider, ModuleConfig, StateSystemModule, TraceEvent, VecEventSource,
//! };
//! use std::sync::Arc;
//!
//! let source = Arc::new(VecEventSource::from_events(vec![
//!     TraceEvent::new(0, &["A"], 1),
//!     TraceEvent::new(10, &["A"], 2),
//! ])?);
//!
//! let module = StateSystemModule::new(
//!     ModuleConfig::new("example").with_directory("./traces"),
//!     Arc::new(|| Box::new(AttributeValueProvider::new("example", 1)) as _),
//!     source,
//! );
//! module.execute()?;
//!
//! let ss = module.state_system().unwrap();
//! let a = ss.quark_absolute(&["A"])?;
//! assert_eq!(ss.query_single_state(5, a)?.value, 1.into());
//! ```

pub mod attributes;
pub mod backend;
pub mod error;
pub mod module;
pub mod provider;
pub mod source;
pub mod statesystem;
pub mod types;

// Re-exports
pub use attributes::{AttributePool, AttributeTree, PoolOrder, PATH_SEPARATOR};
pub use backend::{
    HistoryFileBackend, InMemoryBackend, NullBackend, PartialHistoryBackend, StateBackend,
    HISTORY_FILE_EXTENSION,
};
pub use error::{Result, StateError};
pub use module::{
    AnalysisRegistry, ModuleConfig, ModuleEvent, ModuleStatus, ProviderFactory,
    StateSystemModule, Subscription, SubscriptionId,
};
pub use provider::{
    AttributeValueProvider, FutureChange, FutureEvents, PipelineState, ProviderContext,
    ProviderPipeline, StateProvider, DEFAULT_QUEUE_SIZE,
};
pub use source::{CancellationToken, EventSource, RequestOutcome, VecEventSource};
pub use statesystem::{StateSystem, MAX_STACK_DEPTH};
pub use types::*;

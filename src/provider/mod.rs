//! State providers and the construction pipeline that drives them.

mod context;
mod pipeline;
mod state_provider;

pub use context::{FutureChange, FutureEvents, ProviderContext};
pub use pipeline::{PipelineState, ProviderPipeline, DEFAULT_QUEUE_SIZE};
pub use state_provider::{AttributeValueProvider, StateProvider};

//! Modules orchestrate one state system build each.

mod analysis;
mod config;
mod notify;
mod registry;

pub use analysis::{ModuleStatus, ProviderFactory, StateSystemModule};
pub use config::ModuleConfig;
pub use notify::{ModuleEvent, ModuleNotifier, Subscription, SubscriptionId};
pub use registry::AnalysisRegistry;

//! Registry mapping analysis ids to provider factories.

use super::analysis::{ProviderFactory, StateSystemModule};
use super::config::ModuleConfig;
use crate::error::{Result, StateError};
use crate::provider::StateProvider;
use crate::source::EventSource;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Explicitly owned set of known analyses.
#[derive(Default)]
pub struct AnalysisRegistry {
    factories: RwLock<BTreeMap<String, ProviderFactory>>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `id`, returning the factory it replaces.
    pub fn register(&self, id: impl Into<String>, factory: ProviderFactory) -> Option<ProviderFactory> {
        let id = id.into();
        debug!(analysis = %id, "analysis registered");
        self.factories.write().insert(id, factory)
    }

    /// Register a provider; every build gets one of its fresh instances.
    pub fn register_provider<P>(&self, id: impl Into<String>, provider: P) -> Option<ProviderFactory>
    where
        P: StateProvider + Sync + 'static,
    {
        let factory: ProviderFactory = Arc::new(move || provider.new_instance());
        self.register(id, factory)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// New module for analysis `id` reading `source`. `config.id` is set to
    /// `id`.
    pub fn create_module(
        &self,
        id: &str,
        mut config: ModuleConfig,
        source: Arc<dyn EventSource>,
    ) -> Result<Arc<StateSystemModule>> {
        let factory = self
            .factories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StateError::AnalysisNotFound(id.to_string()))?;
        config.id = id.to_string();
        Ok(StateSystemModule::new(config, factory, source))
    }
}

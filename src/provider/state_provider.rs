//! The state provider abstraction.

use super::context::ProviderContext;
use crate::error::Result;
use crate::types::TraceEvent;

/// Turns trace events into state changes.
///
/// `event_handle` is only ever called from one pipeline worker thread, so
/// implementations need no synchronization of their own.
pub trait StateProvider: Send {
    /// Analysis id, used in thread names and logs.
    fn id(&self) -> &str;

    /// Version of the produced history. A stored history written by another
    /// version is discarded and rebuilt.
    fn version(&self) -> u32;

    /// Apply the state changes caused by `event`.
    fn event_handle(&mut self, event: &TraceEvent, ctx: &mut ProviderContext<'_>) -> Result<()>;

    /// Called once after the last event, before the history is closed.
    fn done(&mut self, _ctx: &mut ProviderContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Fresh provider with the same configuration and no event state.
    fn new_instance(&self) -> Box<dyn StateProvider>;
}

/// Provider for events that are already `(timestamp, path, value)` state
/// changes: a non-null value modifies the attribute at `path`, a null value
/// removes it. Events with an empty path are ignored.
#[derive(Clone, Debug)]
pub struct AttributeValueProvider {
    id: String,
    version: u32,
}

impl AttributeValueProvider {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl StateProvider for AttributeValueProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn event_handle(&mut self, event: &TraceEvent, ctx: &mut ProviderContext<'_>) -> Result<()> {
        if event.path.is_empty() {
            return Ok(());
        }
        let quark = ctx.quark_absolute_and_add(&event.path)?;
        if event.value.is_null() {
            ctx.remove_attribute(event.timestamp, quark)
        } else {
            ctx.modify_attribute(event.timestamp, event.value.clone(), quark)
        }
    }

    fn new_instance(&self) -> Box<dyn StateProvider> {
        Box::new(self.clone())
    }
}

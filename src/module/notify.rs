//! Module notifications over bounded channels.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Something that happened to a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleEvent {
    /// The state system can be queried.
    Ready,
    /// New events from a growing source were read.
    RangeUpdated,
    /// The history is built and closed.
    Completed,
    /// The build failed.
    Failed(String),
    /// The build was cancelled.
    Cancelled,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: Receiver<ModuleEvent>,
}

/// Broadcasts module events to subscribers.
///
/// A subscriber whose buffer is full, or whose receiver is gone, is dropped
/// instead of blocking the module.
pub struct ModuleNotifier {
    subscribers: RwLock<HashMap<SubscriptionId, Sender<ModuleEvent>>>,
    next_id: AtomicU64,
}

impl ModuleNotifier {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, buffer_size: usize) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer_size.max(1));
        self.subscribers.write().insert(id, sender);
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn broadcast(&self, event: ModuleEvent) {
        let mut to_drop = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, sender) in subscribers.iter() {
                match sender.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        to_drop.push(*id);
                    }
                }
            }
        }

        if !to_drop.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in to_drop {
                subscribers.remove(&id);
            }
        }
    }
}

impl Default for ModuleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

//! Change notification
//!
//! Listeners are called synchronously, in subscription order, for every
//! creation, modification and removal published by a source. Registration
//! hands out a [`Subscription`]; cancelling or dropping it unsubscribes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::id::ItemId;
use crate::state::ItemStatus;

/// What happened to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Destroyed,
}

/// Notification payload: the affected id plus its new status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStateEvent {
    pub id: ItemId,
    pub status: ItemStatus,
    pub kind: ChangeKind,
}

impl ItemStateEvent {
    pub fn created(id: ItemId) -> Self {
        Self { id, status: ItemStatus::Existing, kind: ChangeKind::Created }
    }

    pub fn modified(id: ItemId) -> Self {
        Self { id, status: ItemStatus::Existing, kind: ChangeKind::Modified }
    }

    pub fn destroyed(id: ItemId) -> Self {
        Self { id, status: ItemStatus::ExistingRemoved, kind: ChangeKind::Destroyed }
    }
}

pub trait ItemStateListener: Send + Sync {
    fn state_changed(&self, event: &ItemStateEvent);
}

impl<F> ItemStateListener for F
where
    F: Fn(&ItemStateEvent) + Send + Sync,
{
    fn state_changed(&self, event: &ItemStateEvent) {
        self(event)
    }
}

type ListenerMap = RwLock<BTreeMap<u64, Arc<dyn ItemStateListener>>>;

/// Listener list owned by one notification source
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Arc<ListenerMap>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(id, listener);
        }
        Subscription {
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver `event` to every subscriber, in subscription order
    pub fn notify(&self, event: &ItemStateEvent) {
        // Snapshot first so a listener may unsubscribe from inside the callback
        let snapshot: Vec<Arc<dyn ItemStateListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => {
                tracing::warn!("listener registry poisoned, dropping {:?}", event.kind);
                return;
            }
        };
        for listener in snapshot {
            listener.state_changed(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one registration
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<ListenerMap>,
}

impl Subscription {
    /// Revoke the registration
    pub fn cancel(self) {
        // Drop does the work
    }

    /// Whether the source is still alive and still holds this listener
    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .and_then(|r| r.read().ok().map(|l| l.contains_key(&self.id)))
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut listeners) = registry.write() {
                listeners.remove(&self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NodeId;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<ChangeKind>>>, Arc<dyn ItemStateListener>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn ItemStateListener> =
            Arc::new(move |e: &ItemStateEvent| sink.lock().unwrap().push(e.kind));
        (seen, listener)
    }

    #[test]
    fn test_events_delivered_in_order() {
        let registry = ListenerRegistry::new();
        let (seen, listener) = recorder();
        let _sub = registry.subscribe(listener);

        let id = ItemId::Node(NodeId::generate());
        registry.notify(&ItemStateEvent::created(id.clone()));
        registry.notify(&ItemStateEvent::modified(id.clone()));
        registry.notify(&ItemStateEvent::destroyed(id));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeKind::Created, ChangeKind::Modified, ChangeKind::Destroyed]
        );
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let registry = ListenerRegistry::new();
        let (seen, listener) = recorder();
        let sub = registry.subscribe(listener);
        assert!(sub.is_active());
        assert_eq!(registry.len(), 1);

        sub.cancel();
        assert!(registry.is_empty());
        registry.notify(&ItemStateEvent::created(ItemId::Node(NodeId::generate())));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = ListenerRegistry::new();
        let (_seen, listener) = recorder();
        let sub = registry.subscribe(listener);
        drop(registry);
        assert!(!sub.is_active());
        drop(sub);
    }
}

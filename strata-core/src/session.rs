//! Session overlay
//!
//! Per-session transient changes over a shared base (usually the virtual
//! federation, or a transaction overlay). Nothing reaches the base until
//! [`SessionOverlay::save`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::changelog::ChangeLog;
use crate::error::Result;
use crate::id::{ItemId, Name, NodeId};
use crate::listener::{ItemStateListener, Subscription};
use crate::manager::{ItemStateManager, ItemStateStore, WritableStateManager};
use crate::overlay::Overlay;
use crate::state::{ItemState, ItemStatus, NodeReferences, NodeState, PropertyState};
use crate::value::PropertyType;

pub struct SessionOverlay {
    overlay: Overlay,
}

impl SessionOverlay {
    pub fn new(base: Arc<dyn ItemStateStore>) -> Self {
        Self {
            overlay: Overlay::new(base),
        }
    }

    pub fn base(&self) -> &Arc<dyn ItemStateStore> {
        self.overlay.base()
    }

    /// Flush every pending change into the base as one batch.
    ///
    /// A conflict aborts the whole save with `Stale`; the overlay keeps its
    /// changes (the conflicting shadow marked stale) so the caller can
    /// discard or refresh.
    pub async fn save(&self) -> Result<()> {
        match self.overlay.flush().await {
            Ok(0) => Ok(()),
            Ok(count) => {
                tracing::info!("Session saved {} item changes", count);
                Ok(())
            }
            Err(e) => {
                if e.is_stale() {
                    tracing::warn!("Session save rejected: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Drop every pending change; the base is untouched
    pub async fn discard(&self) {
        self.overlay.discard().await;
    }

    /// Drop the pending change for one item
    pub async fn refresh(&self, id: &ItemId) -> bool {
        self.overlay.refresh(id).await
    }

    pub async fn change_log(&self) -> ChangeLog {
        self.overlay.change_log().await
    }

    /// Status of this session's own copy of `id`, if it has one
    pub async fn shadow_status(&self, id: &ItemId) -> Option<ItemStatus> {
        self.overlay.shadow_status(id).await
    }
}

#[async_trait]
impl ItemStateManager for SessionOverlay {
    async fn get_item_state(&self, id: &ItemId) -> Result<ItemState> {
        self.overlay.get(id).await
    }

    async fn has_item_state(&self, id: &ItemId) -> Result<bool> {
        self.overlay.has(id).await
    }

    async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences> {
        self.overlay.get_node_references(id).await
    }
}

#[async_trait]
impl ItemStateStore for SessionOverlay {
    async fn check(&self, _changes: &ChangeLog) -> Result<()> {
        // absorbing is validated under the shadow lock in `apply`
        Ok(())
    }

    async fn apply(&self, changes: ChangeLog) -> Result<()> {
        self.overlay.absorb(changes).await
    }

    fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.overlay.subscribe(listener)
    }

    fn is_virtual(&self, id: &NodeId) -> bool {
        self.overlay.base().is_virtual(id)
    }
}

#[async_trait]
impl WritableStateManager for SessionOverlay {
    async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        id: Option<NodeId>,
    ) -> Result<NodeState> {
        self.overlay.create_node_state(parent, name, primary_type, id).await
    }

    async fn create_property_state(
        &self,
        parent: &NodeId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<PropertyState> {
        self.overlay
            .create_property_state(parent, name, property_type, multi_valued)
            .await
    }

    async fn store(&self, state: ItemState) -> Result<()> {
        self.overlay.store(state).await
    }

    async fn destroy(&self, id: &ItemId) -> Result<()> {
        self.overlay.destroy(id).await
    }

    async fn is_dirty(&self) -> bool {
        self.overlay.is_dirty().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalStore;
    use crate::config::StrataConfig;
    use crate::id::{names, PropertyId};
    use crate::persistence::MemoryPersistenceManager;
    use crate::value::InternalValue;

    async fn base() -> Arc<CanonicalStore> {
        let pm = Arc::new(MemoryPersistenceManager::new());
        let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
        store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
        Arc::new(store)
    }

    async fn set_title(session: &SessionOverlay, value: &str) -> PropertyId {
        let id = PropertyId::new(NodeId::ROOT, Name::from("title"));
        let mut prop = match session.get_property_state(&id).await {
            Ok(prop) => prop,
            Err(_) => session
                .create_property_state(&NodeId::ROOT, Name::from("title"), PropertyType::String, false)
                .await
                .unwrap(),
        };
        prop.values = vec![InternalValue::String(value.to_string())];
        session.store(ItemState::Property(prop)).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_save_then_fresh_session_sees_value() {
        let base = base().await;
        let session = SessionOverlay::new(base.clone());
        let id = set_title(&session, "saved").await;
        assert!(session.is_dirty().await);
        assert!(base.get_property_state(&id).await.unwrap_err().is_not_found());

        session.save().await.unwrap();
        assert!(!session.is_dirty().await);

        let fresh = SessionOverlay::new(base);
        let prop = fresh.get_property_state(&id).await.unwrap();
        assert_eq!(prop.values, vec![InternalValue::String("saved".into())]);
    }

    #[tokio::test]
    async fn test_discard_restores_base_view() {
        let base = base().await;
        let session = SessionOverlay::new(base.clone());
        let id = set_title(&session, "original").await;
        session.save().await.unwrap();

        set_title(&session, "changed").await;
        assert_eq!(
            session.get_property_state(&id).await.unwrap().values,
            vec![InternalValue::String("changed".into())]
        );
        session.discard().await;

        assert_eq!(
            session.get_property_state(&id).await.unwrap().values,
            vec![InternalValue::String("original".into())]
        );
        assert_eq!(
            SessionOverlay::new(base).get_property_state(&id).await.unwrap().values,
            vec![InternalValue::String("original".into())]
        );
    }

    #[tokio::test]
    async fn test_conflicting_save_marks_stale() {
        let base = base().await;
        let seed = SessionOverlay::new(base.clone());
        let id = set_title(&seed, "v0").await;
        seed.save().await.unwrap();

        let first = SessionOverlay::new(base.clone());
        let second = SessionOverlay::new(base.clone());
        set_title(&first, "first").await;
        set_title(&second, "second").await;

        first.save().await.unwrap();
        let err = second.save().await.unwrap_err();
        assert!(err.is_stale());
        let item = ItemId::Property(id.clone());
        assert_eq!(second.shadow_status(&item).await, Some(ItemStatus::StaleModified));

        // a stale copy refuses further changes until refreshed
        let stale = second.get_property_state(&id).await.unwrap();
        assert!(second.store(ItemState::Property(stale)).await.unwrap_err().is_stale());
        assert!(second.refresh(&item).await);
        set_title(&second, "second again").await;
        second.save().await.unwrap();

        assert_eq!(
            base.get_property_state(&id).await.unwrap().values,
            vec![InternalValue::String("second again".into())]
        );
    }

    #[tokio::test]
    async fn test_subtree_removal_saved_children_first() {
        let base = base().await;
        let session = SessionOverlay::new(base.clone());
        let a = session
            .create_node_state(&NodeId::ROOT, Name::from("a"), Name::from(names::NT_UNSTRUCTURED), None)
            .await
            .unwrap();
        let b = session
            .create_node_state(&a.id, Name::from("b"), Name::from(names::NT_UNSTRUCTURED), None)
            .await
            .unwrap();
        session.save().await.unwrap();
        assert!(base.has_item_state(&ItemId::Node(b.id)).await.unwrap());

        session.destroy(&ItemId::Node(a.id)).await.unwrap();
        let changes = session.change_log().await;
        let pos = |id: NodeId| changes.deleted.iter().position(|s| s.id() == ItemId::Node(id)).unwrap();
        assert!(pos(b.id) < pos(a.id));

        session.save().await.unwrap();
        assert!(!base.has_item_state(&ItemId::Node(a.id)).await.unwrap());
        assert!(!base.has_item_state(&ItemId::Node(b.id)).await.unwrap());
        assert!(base.get_node_state(&NodeId::ROOT).await.unwrap().child_entries.is_empty());
    }
}

//! Copy-on-write shadow set over a base layer
//!
//! Shared by the session and transaction overlays. Reads of unshadowed ids
//! go to the base; the first mutation of an existing item clones the base
//! state into a shadow (`Existing -> ExistingModified`) and remembers the base
//! counter it was cloned from. Flushing hands the ordered change log to the
//! base, which re-checks those counters.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::changelog::ChangeLog;
use crate::error::{Result, StateError};
use crate::id::{ItemId, Name, NodeId, PropertyId};
use crate::listener::{ItemStateEvent, ItemStateListener, ListenerRegistry, Subscription};
use crate::manager::ItemStateStore;
use crate::state::{ItemState, ItemStatus, NodeReferences, NodeState, PropertyState};
use crate::value::PropertyType;

type Shadows = HashMap<ItemId, ItemState>;

pub struct Overlay {
    base: Arc<dyn ItemStateStore>,
    shadows: RwLock<Shadows>,
    listeners: ListenerRegistry,
}

impl Overlay {
    pub fn new(base: Arc<dyn ItemStateStore>) -> Self {
        Self {
            base,
            shadows: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn base(&self) -> &Arc<dyn ItemStateStore> {
        &self.base
    }

    pub async fn get(&self, id: &ItemId) -> Result<ItemState> {
        let shadows = self.shadows.read().await;
        self.view(&shadows, id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.clone()))
    }

    pub async fn has(&self, id: &ItemId) -> Result<bool> {
        let shadows = self.shadows.read().await;
        Ok(self.view(&shadows, id).await?.is_some())
    }

    pub async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences> {
        self.base.get_node_references(id).await
    }

    /// Current state of `id` as seen through this overlay
    async fn view(&self, shadows: &Shadows, id: &ItemId) -> Result<Option<ItemState>> {
        if let Some(shadow) = shadows.get(id) {
            return Ok(match shadow.status() {
                ItemStatus::ExistingRemoved | ItemStatus::StaleDestroyed => None,
                _ => Some(shadow.clone()),
            });
        }
        match self.base.get_item_state(id).await {
            Ok(mut state) => {
                // whatever the base's own bookkeeping, for us it simply exists
                state.set_status(ItemStatus::Existing);
                state.set_base_mod_count(None);
                Ok(Some(state))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Shadow of `id` ready for mutation, cloned from the base if needed
    async fn shadow_for_update<'a>(&self, shadows: &'a mut Shadows, id: &ItemId) -> Result<&'a mut ItemState> {
        if !shadows.contains_key(id) {
            let mut state = self.base.get_item_state(id).await?;
            state.set_base_mod_count(Some(state.mod_count()));
            state.set_status(ItemStatus::ExistingModified);
            shadows.insert(id.clone(), state);
        }
        let state = shadows.get_mut(id).ok_or_else(|| StateError::NotFound(id.clone()))?;
        match state.status() {
            s if s.is_stale() => Err(StateError::Stale(id.clone())),
            ItemStatus::ExistingRemoved => Err(StateError::NotFound(id.clone())),
            _ => Ok(state),
        }
    }

    async fn update_node(
        &self,
        shadows: &mut Shadows,
        id: &NodeId,
        f: impl FnOnce(&mut NodeState) + Send,
    ) -> Result<()> {
        let item = ItemId::Node(*id);
        let state = self.shadow_for_update(shadows, &item).await?;
        let ItemState::Node(node) = state else {
            return Err(StateError::InvalidState(format!("{} is not a node", item)));
        };
        f(node);
        node.mod_count += 1;
        Ok(())
    }

    pub async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        id: Option<NodeId>,
    ) -> Result<NodeState> {
        let id = id.unwrap_or_else(NodeId::generate);
        if self.base.is_virtual(&id) {
            return Err(StateError::Configuration(format!(
                "{} lies in a virtual provider's reserved range",
                id
            )));
        }

        let mut shadows = self.shadows.write().await;
        if self.view(&shadows, &ItemId::Node(id)).await?.is_some() {
            return Err(StateError::ItemExists(format!("node {}", id)));
        }
        self.update_node(&mut shadows, parent, |p| {
            p.add_child_entry(name, id);
        })
        .await?;

        let node = NodeState::new(id, Some(*parent), primary_type);
        shadows.insert(ItemId::Node(id), ItemState::Node(node.clone()));
        Ok(node)
    }

    /// A transient property for `parent`; nothing is recorded until `store`
    pub async fn create_property_state(
        &self,
        parent: &NodeId,
        name: Name,
        property_type: PropertyType,
        multi_valued: bool,
    ) -> Result<PropertyState> {
        let shadows = self.shadows.read().await;
        let node = self
            .view(&shadows, &ItemId::Node(*parent))
            .await?
            .and_then(ItemState::into_node)
            .ok_or(StateError::NotFound(ItemId::Node(*parent)))?;
        if node.has_property_name(&name) {
            return Err(StateError::ItemExists(format!("property {}", PropertyId::new(*parent, name))));
        }
        Ok(PropertyState::new(PropertyId::new(*parent, name), property_type, multi_valued))
    }

    /// Record a new or modified state.
    ///
    /// A state of an existing item must have been read through this overlay;
    /// its modification counter is the base counter checked at flush.
    pub async fn store(&self, mut state: ItemState) -> Result<()> {
        let id = state.id();
        let mut shadows = self.shadows.write().await;

        if let Some(shadow) = shadows.get(&id) {
            match shadow.status() {
                s if s.is_stale() => return Err(StateError::Stale(id)),
                ItemStatus::ExistingRemoved => return Err(StateError::NotFound(id)),
                status => {
                    state.set_status(status);
                    state.set_base_mod_count(shadow.base_mod_count());
                    state.set_mod_count(shadow.mod_count() + 1);
                }
            }
            shadows.insert(id, state);
            return Ok(());
        }

        let in_base = self.view(&shadows, &id).await?.is_some();
        match (state.status(), in_base) {
            (ItemStatus::New, true) => return Err(StateError::ItemExists(id.to_string())),
            (ItemStatus::New, false) => {
                if state.is_node() {
                    return Err(StateError::InvalidState(format!(
                        "new node {} must be created through create_node_state",
                        id
                    )));
                }
                state.set_base_mod_count(None);
                state.set_mod_count(0);
            }
            (_, false) => return Err(StateError::NotFound(id)),
            (_, true) => {
                state.set_base_mod_count(Some(state.mod_count()));
                state.set_mod_count(state.mod_count() + 1);
                state.set_status(ItemStatus::ExistingModified);
            }
        }

        if let ItemState::Property(prop) = &state {
            let parent = *prop.parent_id();
            let name = prop.name().clone();
            let linked = self
                .view(&shadows, &ItemId::Node(parent))
                .await?
                .and_then(ItemState::into_node)
                .is_some_and(|n| n.has_property_name(&name));
            if !linked {
                self.update_node(&mut shadows, &parent, |n| {
                    n.property_names.insert(name);
                })
                .await?;
            }
        }
        shadows.insert(id, state);
        Ok(())
    }

    /// Remove an item; nodes go with their whole subtree.
    ///
    /// The removal set and the parent are checked before the first shadow
    /// changes, so a failure leaves the overlay as it was.
    pub async fn destroy(&self, id: &ItemId) -> Result<()> {
        let mut shadows = self.shadows.write().await;
        let state = self
            .view(&shadows, id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.clone()))?;

        let (parent, removed) = match &state {
            ItemState::Property(prop) => (*prop.parent_id(), vec![state.clone()]),
            ItemState::Node(node) => {
                let Some(parent) = node.parent_id else {
                    return Err(StateError::ConstraintViolation("cannot remove the root node".into()));
                };
                (parent, self.subtree(&shadows, node.clone()).await?)
            }
        };

        let parent_item = ItemId::Node(parent);
        for item in removed.iter().map(ItemState::id).chain(std::iter::once(parent_item.clone())) {
            if shadows.get(&item).is_some_and(|s| s.status().is_stale()) {
                return Err(StateError::Stale(item));
            }
        }
        let parent_state = self
            .view(&shadows, &parent_item)
            .await?
            .ok_or_else(|| StateError::NotFound(parent_item.clone()))?;

        for item in removed {
            mark_removed(&mut shadows, item);
        }
        let shadow = shadows.entry(parent_item).or_insert_with(|| {
            let mut base = parent_state;
            base.set_base_mod_count(Some(base.mod_count()));
            base.set_status(ItemStatus::ExistingModified);
            base
        });
        if let ItemState::Node(node) = shadow {
            match &state {
                ItemState::Property(prop) => {
                    node.property_names.remove(prop.name());
                }
                ItemState::Node(removed) => {
                    node.remove_child_entry(&removed.id);
                }
            }
            node.mod_count += 1;
        }
        Ok(())
    }

    /// Every item below and including `root`, as currently visible
    async fn subtree(&self, shadows: &Shadows, root: NodeState) -> Result<Vec<ItemState>> {
        let mut items = Vec::new();
        let mut pending = vec![root];
        while let Some(node) = pending.pop() {
            for name in &node.property_names {
                if let Some(prop) = self.view(shadows, &ItemId::Property(node.property_id(name))).await? {
                    items.push(prop);
                }
            }
            for entry in &node.child_entries {
                if self.base.is_virtual(&entry.id) {
                    continue;
                }
                if let Some(ItemState::Node(child)) = self.view(shadows, &ItemId::Node(entry.id)).await? {
                    pending.push(child);
                }
            }
            items.push(ItemState::Node(node));
        }
        Ok(items)
    }

    async fn remove_item(&self, shadows: &mut Shadows, id: &ItemId) -> Result<()> {
        match shadows.get(id).map(|s| s.status()) {
            Some(ItemStatus::New) => {
                shadows.remove(id);
            }
            Some(s) if s.is_stale() => return Err(StateError::Stale(id.clone())),
            Some(ItemStatus::ExistingRemoved) => {}
            Some(_) => {
                if let Some(shadow) = shadows.get_mut(id) {
                    shadow.set_status(ItemStatus::ExistingRemoved);
                }
            }
            None => {
                let mut state = self.base.get_item_state(id).await?;
                state.set_base_mod_count(Some(state.mod_count()));
                state.set_status(ItemStatus::ExistingRemoved);
                shadows.insert(id.clone(), state);
            }
        }
        Ok(())
    }

    pub async fn is_dirty(&self) -> bool {
        self.shadows.read().await.values().any(|s| s.status().is_dirty())
    }

    /// Pending changes as an ordered change log
    pub async fn change_log(&self) -> ChangeLog {
        ChangeLog::from_shadows(self.shadows.read().await.values())
    }

    /// Validate pending changes against the base without applying them
    pub async fn check(&self) -> Result<()> {
        let changes = self.change_log().await;
        if changes.is_empty() {
            return Ok(());
        }
        self.base.check(&changes).await
    }

    /// Flush every dirty shadow into the base as one change log.
    ///
    /// On a conflict nothing is applied and the offending shadow turns stale.
    pub async fn flush(&self) -> Result<usize> {
        let mut shadows = self.shadows.write().await;
        let changes = ChangeLog::from_shadows(shadows.values());
        self.flush_log(&mut shadows, changes).await
    }

    /// Flush a change log built earlier (e.g. at prepare time)
    pub async fn flush_prepared(&self, changes: ChangeLog) -> Result<usize> {
        let mut shadows = self.shadows.write().await;
        self.flush_log(&mut shadows, changes).await
    }

    async fn flush_log(&self, shadows: &mut Shadows, changes: ChangeLog) -> Result<usize> {
        let count = changes.len();
        if count > 0 {
            if let Err(e) = self.base.apply(changes).await {
                if let StateError::Stale(id) = &e {
                    let status = match self.base.has_item_state(id).await {
                        Ok(true) => ItemStatus::StaleModified,
                        _ => ItemStatus::StaleDestroyed,
                    };
                    if let Some(shadow) = shadows.get_mut(id) {
                        shadow.set_status(status);
                    }
                }
                return Err(e);
            }
        }
        shadows.clear();
        Ok(count)
    }

    pub async fn discard(&self) {
        self.shadows.write().await.clear();
    }

    /// Forget the shadow of `id`, e.g. after it turned stale
    pub async fn refresh(&self, id: &ItemId) -> bool {
        self.shadows.write().await.remove(id).is_some()
    }

    pub async fn shadow_status(&self, id: &ItemId) -> Option<ItemStatus> {
        self.shadows.read().await.get(id).map(|s| s.status())
    }

    /// Take a change log from an overlay stacked on this one into the
    /// shadow set, all or nothing
    pub async fn absorb(&self, changes: ChangeLog) -> Result<()> {
        let mut events = Vec::with_capacity(changes.len());
        {
            let mut shadows = self.shadows.write().await;

            for state in changes.modified.iter().chain(changes.deleted.iter()) {
                let id = state.id();
                if shadows.get(&id).is_some_and(|s| s.status().is_stale()) {
                    return Err(StateError::Stale(id));
                }
                let current = self.view(&shadows, &id).await?;
                match (current, state.base_mod_count()) {
                    (Some(cur), Some(expected)) if cur.mod_count() != expected => {
                        return Err(StateError::Stale(id));
                    }
                    (None, Some(_)) => return Err(StateError::Stale(id)),
                    (None, None) if !changes.is_deleted(&id) => return Err(StateError::NotFound(id)),
                    _ => {}
                }
            }
            for state in &changes.added {
                let id = state.id();
                if self.view(&shadows, &id).await?.is_some() {
                    return Err(StateError::ItemExists(id.to_string()));
                }
            }

            for state in changes.added.iter().chain(changes.modified.iter()) {
                let id = state.id();
                let mut next = state.clone();
                let created = changes.is_added(&id);
                match shadows.get(&id) {
                    Some(shadow) => {
                        let status = match shadow.status() {
                            ItemStatus::New => ItemStatus::New,
                            _ => ItemStatus::ExistingModified,
                        };
                        next.set_status(status);
                        next.set_base_mod_count(shadow.base_mod_count());
                        next.set_mod_count(shadow.mod_count() + 1);
                    }
                    None if created => {
                        next.set_status(ItemStatus::New);
                        next.set_base_mod_count(None);
                        next.set_mod_count(0);
                    }
                    None => {
                        let base = self.base.get_item_state(&id).await?;
                        next.set_status(ItemStatus::ExistingModified);
                        next.set_base_mod_count(Some(base.mod_count()));
                        next.set_mod_count(base.mod_count() + 1);
                    }
                }
                shadows.insert(id.clone(), next);
                events.push(if created {
                    ItemStateEvent::created(id)
                } else {
                    ItemStateEvent::modified(id)
                });
            }
            for state in &changes.deleted {
                let id = state.id();
                if self.view(&shadows, &id).await?.is_some() {
                    self.remove_item(&mut shadows, &id).await?;
                    events.push(ItemStateEvent::destroyed(id));
                }
            }
        }

        for event in &events {
            self.listeners.notify(event);
        }
        Ok(())
    }

    pub fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }
}

/// Record `state` as removed; a new item is simply forgotten
fn mark_removed(shadows: &mut Shadows, state: ItemState) {
    let id = state.id();
    match shadows.get(&id).map(ItemState::status) {
        Some(ItemStatus::New) => {
            shadows.remove(&id);
        }
        Some(_) => {
            if let Some(shadow) = shadows.get_mut(&id) {
                shadow.set_status(ItemStatus::ExistingRemoved);
            }
        }
        None => {
            let mut state = state;
            state.set_base_mod_count(Some(state.mod_count()));
            state.set_status(ItemStatus::ExistingRemoved);
            shadows.insert(id, state);
        }
    }
}

//! Virtual state federation
//!
//! Sits above the canonical store and every mounted virtual provider and
//! routes each lookup to exactly one owner: a provider whose reserved range
//! contains the id, else a provider that claims it explicitly, else the
//! canonical store. Properties route with their parent node.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::canonical::{CanonicalStore, ReferenceDelta};
use crate::changelog::ChangeLog;
use crate::error::{Result, StateError};
use crate::id::{ItemId, Name, NodeId};
use crate::listener::{ItemStateEvent, ItemStateListener, ListenerRegistry, Subscription};
use crate::manager::{ItemStateManager, ItemStateStore};
use crate::state::{ItemState, NodeReferences};
use crate::value::InternalValue;
use crate::vstate::VirtualItemStateProvider;

type Provider = Arc<dyn VirtualItemStateProvider>;

pub struct VirtualFederation {
    canonical: Arc<CanonicalStore>,
    providers: RwLock<Vec<Provider>>,
    listeners: Arc<ListenerRegistry>,
    /// Forwarding registrations at the canonical store and every provider
    forwarding: Mutex<Vec<Subscription>>,
}

fn forward_to(listeners: &Arc<ListenerRegistry>) -> Arc<dyn ItemStateListener> {
    let listeners = listeners.clone();
    Arc::new(move |event: &ItemStateEvent| listeners.notify(event))
}

impl VirtualFederation {
    pub fn new(canonical: Arc<CanonicalStore>) -> Self {
        let listeners = Arc::new(ListenerRegistry::new());
        let subscription = canonical.subscribe(forward_to(&listeners));
        Self {
            canonical,
            providers: RwLock::new(Vec::new()),
            listeners,
            forwarding: Mutex::new(vec![subscription]),
        }
    }

    pub fn canonical(&self) -> &Arc<CanonicalStore> {
        &self.canonical
    }

    pub fn provider_count(&self) -> usize {
        self.providers.read().map(|p| p.len()).unwrap_or(0)
    }

    /// Mount a provider.
    ///
    /// Fails with `Configuration` if its root already exists canonically, or
    /// if its root or range collides with an already mounted provider.
    pub async fn mount(&self, provider: Provider) -> Result<()> {
        let root = provider.virtual_root_id();
        if self.canonical.has_item_state(&ItemId::Node(root)).await? {
            return Err(StateError::Configuration(format!(
                "virtual root {} is already a canonical node",
                root
            )));
        }

        {
            let mut providers = self.providers.write().map_err(|_| poisoned())?;
            for other in providers.iter() {
                let range_clash = match (provider.reserved_range(), other.reserved_range()) {
                    (Some(a), Some(b)) => a.overlaps(&b),
                    _ => false,
                };
                if range_clash || other.owns(&root) || provider.owns(&other.virtual_root_id()) {
                    return Err(StateError::Configuration(format!(
                        "virtual provider rooted at {} collides with provider rooted at {}",
                        root,
                        other.virtual_root_id()
                    )));
                }
            }
            providers.push(provider.clone());
        }

        let subscription = provider.add_listener(forward_to(&self.listeners));
        if let Ok(mut forwarding) = self.forwarding.lock() {
            forwarding.push(subscription);
        }
        tracing::info!("Mounted virtual provider at {}", root);
        Ok(())
    }

    /// Link a mounted provider's root as child `name` of canonical node `parent`.
    ///
    /// The entry is persisted flagged as mounted; readers of the canonical
    /// store alone skip it.
    pub async fn attach(&self, parent: &NodeId, name: Name, root: NodeId) -> Result<()> {
        if self.provider_for(&root)?.is_none() {
            return Err(StateError::Configuration(format!("{} is not a mounted virtual root", root)));
        }
        let mut node = self.canonical.get_node_state(parent).await?;
        if node.child_entry_by_id(&root).is_some() {
            return Ok(());
        }
        node.add_mounted_entry(name, root);
        self.canonical.store(ItemState::Node(node)).await
    }

    /// The single provider owning `id`, if it is virtual
    fn provider_for(&self, id: &NodeId) -> Result<Option<Provider>> {
        let providers = self.providers.read().map_err(|_| poisoned())?;
        if let Some(p) = providers
            .iter()
            .find(|p| p.reserved_range().is_some_and(|r| r.contains(id)))
        {
            return Ok(Some(p.clone()));
        }
        let mut owners = providers.iter().filter(|p| p.owns(id));
        match (owners.next(), owners.next()) {
            (None, _) => Ok(None),
            (Some(p), None) => Ok(Some(p.clone())),
            (Some(_), Some(_)) => Err(StateError::Configuration(format!(
                "{} is claimed by more than one virtual provider",
                id
            ))),
        }
    }

    /// Reject changes to virtual items and strong references to missing
    /// virtual nodes
    async fn check_virtual(&self, changes: &ChangeLog) -> Result<()> {
        for state in changes.entries() {
            let id = state.id();
            if self.provider_for(id.owning_node())?.is_some() {
                return Err(StateError::ConstraintViolation(format!(
                    "{} is a virtual item and cannot be written",
                    id
                )));
            }
            if changes.is_deleted(&id) {
                continue;
            }
            let Some(prop) = state.as_property() else {
                continue;
            };
            for value in &prop.values {
                let InternalValue::Reference(target) = value else {
                    continue;
                };
                if let Some(provider) = self.provider_for(target)? {
                    if !provider.has_item_state(&ItemId::Node(*target)).await? {
                        return Err(StateError::ReferentialIntegrity(format!(
                            "{} references missing virtual node {}",
                            prop.id, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    async fn forward_references(&self, deltas: Vec<ReferenceDelta>) -> Result<()> {
        let mut by_target: BTreeMap<NodeId, Vec<ReferenceDelta>> = BTreeMap::new();
        for delta in deltas {
            by_target.entry(delta.target).or_default().push(delta);
        }

        for (target, deltas) in by_target {
            let Some(provider) = self.provider_for(&target)? else {
                continue;
            };
            let mut refs = provider.get_node_references(&target).await?;
            for delta in deltas {
                if delta.added {
                    refs.add_reference(delta.property, delta.weak);
                } else {
                    refs.remove_reference(&delta.property);
                }
            }
            if !provider.set_node_references(&refs).await? {
                tracing::warn!("Virtual provider refused references record for {}", target);
            }
        }
        Ok(())
    }
}

fn poisoned() -> StateError {
    StateError::InvalidState("provider list poisoned".into())
}

#[async_trait]
impl ItemStateManager for VirtualFederation {
    async fn get_item_state(&self, id: &ItemId) -> Result<ItemState> {
        match self.provider_for(id.owning_node())? {
            Some(provider) => provider.get_item_state(id).await,
            None => self.canonical.get_item_state(id).await,
        }
    }

    async fn has_item_state(&self, id: &ItemId) -> Result<bool> {
        match self.provider_for(id.owning_node())? {
            Some(provider) => provider.has_item_state(id).await,
            None => self.canonical.has_item_state(id).await,
        }
    }

    async fn get_node_references(&self, id: &NodeId) -> Result<NodeReferences> {
        match self.provider_for(id)? {
            Some(provider) => provider.get_node_references(id).await,
            None => self.canonical.get_node_references(id).await,
        }
    }
}

#[async_trait]
impl ItemStateStore for VirtualFederation {
    async fn check(&self, changes: &ChangeLog) -> Result<()> {
        self.check_virtual(changes).await?;
        self.canonical.check(changes).await
    }

    async fn apply(&self, changes: ChangeLog) -> Result<()> {
        self.check_virtual(&changes).await?;
        let is_virtual = |id: &NodeId| self.is_virtual(id);
        let deltas = self.canonical.apply_with(changes, &is_virtual).await?;
        self.forward_references(deltas).await
    }

    fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    fn is_virtual(&self, id: &NodeId) -> bool {
        // an ambiguous id is still not canonical
        !matches!(self.provider_for(id), Ok(None))
    }
}

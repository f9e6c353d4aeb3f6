//! Transaction overlay
//!
//! Adds two-phase demarcation to an overlay. While a transaction is active,
//! a session stacked on this overlay saves into it; the changes reach the
//! base only on `commit`. Outside a transaction, saves pass straight through.
//!
//! The change log built at `prepare` is kept until `commit` succeeds, so a
//! commit retried after a failure re-delivers the same log id and the
//! canonical store acknowledges it instead of applying it twice.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::changelog::ChangeLog;
use crate::error::{Result, StateError};
use crate::id::{ItemId, Name, NodeId};
use crate::listener::{ItemStateListener, Subscription};
use crate::manager::{ItemStateManager, ItemStateStore, WritableStateManager};
use crate::overlay::Overlay;
use crate::state::{ItemState, NodeReferences, NodeState, PropertyState};
use crate::value::PropertyType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionStatus {
    Idle,
    Active,
    Prepared,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    fn is_open(&self) -> bool {
        matches!(self, TransactionStatus::Active | TransactionStatus::Prepared)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct TxState {
    status: TransactionStatus,
    xid: Option<String>,
    /// Change log fixed at prepare time
    pending: Option<ChangeLog>,
}

pub struct TransactionOverlay {
    overlay: Overlay,
    tx: Mutex<TxState>,
}

impl TransactionOverlay {
    pub fn new(base: Arc<dyn ItemStateStore>) -> Self {
        Self {
            overlay: Overlay::new(base),
            tx: Mutex::new(TxState {
                status: TransactionStatus::Idle,
                xid: None,
                pending: None,
            }),
        }
    }

    pub async fn status(&self) -> TransactionStatus {
        self.tx.lock().await.status
    }

    pub async fn xid(&self) -> Option<String> {
        self.tx.lock().await.xid.clone()
    }

    pub async fn begin(&self, xid: impl Into<String>) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.status.is_open() {
            return Err(StateError::InvalidState(format!(
                "transaction {} is still {}",
                tx.xid.as_deref().unwrap_or("?"),
                tx.status
            )));
        }
        if self.overlay.is_dirty().await {
            return Err(StateError::InvalidState("overlay has uncommitted changes".into()));
        }
        let xid = xid.into();
        tracing::debug!("Transaction {} started", xid);
        tx.status = TransactionStatus::Active;
        tx.xid = Some(xid);
        tx.pending = None;
        Ok(())
    }

    /// Re-validate every pending change against the base without applying.
    ///
    /// On failure the transaction stays active; the caller may roll back.
    pub async fn prepare(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        match tx.status {
            TransactionStatus::Prepared => return Ok(()),
            TransactionStatus::Active => {}
            status => {
                return Err(StateError::InvalidState(format!("cannot prepare a {} transaction", status)));
            }
        }

        let changes = self.overlay.change_log().await;
        if let Err(e) = self.overlay.base().check(&changes).await {
            tracing::warn!("Transaction {:?} failed to prepare: {}", tx.xid, e);
            return Err(e);
        }
        tracing::debug!("Transaction {:?} prepared ({} changes)", tx.xid, changes.len());
        tx.pending = Some(changes);
        tx.status = TransactionStatus::Prepared;
        Ok(())
    }

    /// Flush the transaction into the base. Committing an active transaction
    /// prepares it implicitly; committing twice is a no-op.
    pub async fn commit(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let changes = match tx.status {
            TransactionStatus::Committed => return Ok(()),
            TransactionStatus::Prepared => match &tx.pending {
                Some(changes) => changes.clone(),
                None => self.overlay.change_log().await,
            },
            TransactionStatus::Active => {
                let changes = self.overlay.change_log().await;
                tx.pending = Some(changes.clone());
                changes
            }
            status => {
                return Err(StateError::InvalidState(format!("cannot commit a {} transaction", status)));
            }
        };

        match self.overlay.flush_prepared(changes).await {
            Ok(count) => {
                tracing::info!("Transaction {:?} committed ({} changes)", tx.xid, count);
                tx.status = TransactionStatus::Committed;
                tx.pending = None;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Transaction {:?} failed to commit: {}", tx.xid, e);
                Err(e)
            }
        }
    }

    /// Discard the transaction's changes. Always succeeds.
    pub async fn rollback(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        self.overlay.discard().await;
        tracing::debug!("Transaction {:?} rolled back", tx.xid);
        tx.status = TransactionStatus::RolledBack;
        tx.pending = None;
        Ok(())
    }

    async fn require_active(&self) -> Result<()> {
        match self.status().await {
            TransactionStatus::Active => Ok(()),
            status => Err(StateError::InvalidState(format!(
                "changes require an active transaction (status {})",
                status
            ))),
        }
    }
}

#[async_trait]
impl ItemStateManager for TransactionOverlay {
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
impl ItemStateStore for TransactionOverlay {
    async fn check(&self, changes: &ChangeLog) -> Result<()> {
        match self.status().await {
            TransactionStatus::Active => Ok(()),
            _ => self.overlay.base().check(changes).await,
        }
    }

    async fn apply(&self, changes: ChangeLog) -> Result<()> {
        let tx = self.tx.lock().await;
        match tx.status {
            TransactionStatus::Active => self.overlay.absorb(changes).await,
            TransactionStatus::Prepared => Err(StateError::InvalidState(
                "transaction is prepared and accepts no further changes".into(),
            )),
            _ => self.overlay.base().apply(changes).await,
        }
    }

    fn subscribe(&self, listener: Arc<dyn ItemStateListener>) -> Subscription {
        self.overlay.subscribe(listener)
    }

    fn is_virtual(&self, id: &NodeId) -> bool {
        self.overlay.base().is_virtual(id)
    }
}

#[async_trait]
impl WritableStateManager for TransactionOverlay {
    async fn create_node_state(
        &self,
        parent: &NodeId,
        name: Name,
        primary_type: Name,
        id: Option<NodeId>,
    ) -> Result<NodeState> {
        self.require_active().await?;
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
        self.require_active().await?;
        self.overlay.store(state).await
    }

    async fn destroy(&self, id: &ItemId) -> Result<()> {
        self.require_active().await?;
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
    use crate::session::SessionOverlay;
    use crate::value::InternalValue;

    async fn base() -> Arc<CanonicalStore> {
        let pm = Arc::new(MemoryPersistenceManager::new());
        let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
        store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
        Arc::new(store)
    }

    fn title(value: &str) -> PropertyState {
        let mut prop = PropertyState::new(
            PropertyId::new(NodeId::ROOT, Name::from("title")),
            PropertyType::String,
            false,
        );
        prop.values.push(InternalValue::String(value.to_string()));
        prop
    }

    #[tokio::test]
    async fn test_session_saves_into_active_transaction() {
        let base = base().await;
        let tx = Arc::new(TransactionOverlay::new(base.clone()));
        let session = SessionOverlay::new(tx.clone());
        let id = title("x").id;

        tx.begin("xid-1").await.unwrap();
        session.store(ItemState::Property(title("in tx"))).await.unwrap();
        session.save().await.unwrap();

        assert!(tx.is_dirty().await);
        assert!(tx.get_property_state(&id).await.is_ok());
        assert!(base.get_property_state(&id).await.unwrap_err().is_not_found());

        tx.prepare().await.unwrap();
        assert_eq!(tx.status().await, TransactionStatus::Prepared);
        tx.commit().await.unwrap();
        assert_eq!(
            base.get_property_state(&id).await.unwrap().values,
            vec![InternalValue::String("in tx".into())]
        );

        // committing again is a no-op
        let sequence = base.sequence();
        tx.commit().await.unwrap();
        assert_eq!(base.sequence(), sequence);
    }

    #[tokio::test]
    async fn test_idle_transaction_passes_saves_through() {
        let base = base().await;
        let tx = Arc::new(TransactionOverlay::new(base.clone()));
        let session = SessionOverlay::new(tx.clone());
        session.store(ItemState::Property(title("direct"))).await.unwrap();
        session.save().await.unwrap();
        assert!(base.get_property_state(&title("x").id).await.is_ok());
        assert!(!tx.is_dirty().await);
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let base = base().await;
        let tx = TransactionOverlay::new(base.clone());
        tx.begin("xid-2").await.unwrap();
        tx.store(ItemState::Property(title("gone"))).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(tx.status().await, TransactionStatus::RolledBack);
        assert!(!tx.is_dirty().await);
        assert!(base.get_property_state(&title("x").id).await.unwrap_err().is_not_found());

        // a fresh transaction can start afterwards
        tx.begin("xid-3").await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_requires_active_transaction() {
        let tx = TransactionOverlay::new(base().await);
        assert!(matches!(
            tx.store(ItemState::Property(title("x"))).await,
            Err(StateError::InvalidState(_))
        ));

        tx.begin("xid-4").await.unwrap();
        tx.store(ItemState::Property(title("x"))).await.unwrap();
        tx.prepare().await.unwrap();
        assert!(matches!(
            tx.store(ItemState::Property(title("y"))).await,
            Err(StateError::InvalidState(_))
        ));
        assert!(matches!(tx.begin("xid-5").await, Err(StateError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_commit_retry_after_lost_acknowledgement() {
        let base = base().await;
        let tx = TransactionOverlay::new(base.clone());
        tx.begin("xid-6").await.unwrap();
        tx.store(ItemState::Property(title("once"))).await.unwrap();
        tx.prepare().await.unwrap();

        // the coordinator delivered the prepared log, but the commit call was lost
        let prepared = tx.tx.lock().await.pending.clone().unwrap();
        base.apply(prepared).await.unwrap();
        let sequence = base.sequence();

        tx.commit().await.unwrap();
        assert_eq!(base.sequence(), sequence);
        assert_eq!(tx.status().await, TransactionStatus::Committed);
        assert!(!tx.is_dirty().await);
    }
}

//! Strata Core Library
//!
//! Layered item-state core for a hierarchical content repository:
//! - Canonical state store (cached, persisted, batch-applied)
//! - Virtual state federation (computed subtrees mounted by id range)
//! - Session and transaction overlays (copy-on-write shadows over any layer)
//! - Reference tracking and property reconciliation for bulk import
//! - Persistence backends (in-memory and sled)

pub mod canonical;
pub mod changelog;
pub mod config;
pub mod error;
pub mod federation;
pub mod id;
pub mod import;
pub mod listener;
pub mod live;
pub mod manager;
pub mod ops;
pub mod overlay;
pub mod persistence;
pub mod reconcile;
pub mod refs;
pub mod schema;
pub mod session;
pub mod state;
pub mod transaction;
pub mod value;
pub mod vstate;

pub use canonical::{CanonicalStore, ReferenceDelta, StoreStats};
pub use changelog::ChangeLog;
pub use config::StrataConfig;
pub use error::{Result, StateError};
pub use federation::VirtualFederation;
pub use id::{names, IdRange, ItemId, Name, NodeId, PropertyId};
pub use import::{IdBehavior, ImportMode, ImportReport, Importer, NodeInfo};
pub use listener::{ChangeKind, ItemStateEvent, ItemStateListener, ListenerRegistry, Subscription};
pub use live::{LiveNode, Rejection, ScalarAttempt};
pub use manager::{ItemStateManager, ItemStateStore, WritableStateManager};
pub use ops::ItemOps;
pub use persistence::{MemoryPersistenceManager, PersistBatch, PersistenceManager, SledPersistenceManager};
pub use reconcile::{PropInfo, PropertyReconciler, Reconciled, ScalarFallback};
pub use refs::{ReferenceTracker, UnresolvedPolicy};
pub use schema::{
    EffectiveNodeType, NodeTypeDefinition, NodeTypeRegistry, PropDefId, PropertyDefinition,
    StaticNodeTypeRegistry, ValueConstraint,
};
pub use session::SessionOverlay;
pub use state::{ChildNodeEntry, ItemState, ItemStatus, NodeReferences, NodeState, PropertyState, ReferenceEntry};
pub use transaction::{TransactionOverlay, TransactionStatus};
pub use value::{InternalValue, PropertyType, RawValue};
pub use vstate::{node_type_tree, VirtualItemStateProvider, VirtualTreeProvider};

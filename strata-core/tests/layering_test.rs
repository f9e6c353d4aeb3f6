//! Cross-layer behavior: sessions and transactions over the canonical store,
//! virtual federation, and system view import into a persisted store.

use std::sync::Arc;
use strata_core::import::sysview;
use strata_core::{
    names, node_type_tree, CanonicalStore, IdRange, Importer, InternalValue, ItemId, ItemState,
    ItemStateManager, MemoryPersistenceManager, Name, NodeId, PropertyId, PropertyState, PropertyType,
    SessionOverlay, SledPersistenceManager, StateError, StaticNodeTypeRegistry, StrataConfig,
    TransactionOverlay, TransactionStatus, VirtualFederation, VirtualItemStateProvider, WritableStateManager,
};
use tempfile::TempDir;

async fn canonical(pm: Arc<MemoryPersistenceManager>) -> Arc<CanonicalStore> {
    let store = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
    store.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();
    Arc::new(store)
}

fn title_id() -> PropertyId {
    PropertyId::new(NodeId::ROOT, Name::from("title"))
}

fn title(value: &str) -> PropertyState {
    let mut prop = PropertyState::new(title_id(), PropertyType::String, false);
    prop.values.push(InternalValue::String(value.to_string()));
    prop
}

async fn title_of(states: &dyn ItemStateManager) -> Vec<InternalValue> {
    states.get_property_state(&title_id()).await.unwrap().values
}

fn string(value: &str) -> Vec<InternalValue> {
    vec![InternalValue::String(value.to_string())]
}

#[tokio::test]
async fn test_session_visibility() {
    let base = canonical(Arc::new(MemoryPersistenceManager::new())).await;
    let writer = SessionOverlay::new(base.clone());
    let reader = SessionOverlay::new(base.clone());

    writer.store(ItemState::Property(title("draft"))).await.unwrap();
    assert_eq!(title_of(&writer).await, string("draft"));
    assert!(reader.get_property_state(&title_id()).await.unwrap_err().is_not_found());
    assert!(base.get_property_state(&title_id()).await.unwrap_err().is_not_found());

    writer.save().await.unwrap();
    assert!(!writer.is_dirty().await);
    assert_eq!(title_of(base.as_ref()).await, string("draft"));
    assert_eq!(title_of(&reader).await, string("draft"));

    let mut prop = writer.get_property_state(&title_id()).await.unwrap();
    prop.values = string("changed");
    writer.store(ItemState::Property(prop)).await.unwrap();
    assert_eq!(title_of(&writer).await, string("changed"));

    writer.discard().await;
    assert_eq!(title_of(&writer).await, string("draft"));
    assert_eq!(title_of(base.as_ref()).await, string("draft"));
}

#[tokio::test]
async fn test_second_transaction_sees_stale_base() {
    let base = canonical(Arc::new(MemoryPersistenceManager::new())).await;
    let seed = SessionOverlay::new(base.clone());
    seed.store(ItemState::Property(title("v0"))).await.unwrap();
    seed.save().await.unwrap();

    let first = TransactionOverlay::new(base.clone());
    let second = TransactionOverlay::new(base.clone());
    first.begin("xid-first").await.unwrap();
    second.begin("xid-second").await.unwrap();

    for (tx, value) in [(&first, "v1"), (&second, "v2")] {
        let mut prop = tx.get_property_state(&title_id()).await.unwrap();
        prop.values = string(value);
        tx.store(ItemState::Property(prop)).await.unwrap();
    }

    first.prepare().await.unwrap();
    first.commit().await.unwrap();
    assert_eq!(first.status().await, TransactionStatus::Committed);

    let err = second.prepare().await.unwrap_err();
    assert!(err.is_stale(), "{:?}", err);
    assert_eq!(second.status().await, TransactionStatus::Active);
    second.rollback().await.unwrap();

    assert_eq!(title_of(base.as_ref()).await, string("v1"));
}

#[tokio::test]
async fn test_session_over_federation_routes_virtual_reads() {
    let pm = Arc::new(MemoryPersistenceManager::new());
    let base = canonical(pm.clone()).await;
    let federation = Arc::new(VirtualFederation::new(base.clone()));

    let registry = StaticNodeTypeRegistry::with_builtins();
    let range = IdRange::new([0x7e, 0x5e, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00]).unwrap();
    let provider = Arc::new(node_type_tree(&registry, range, NodeId::ROOT).await.unwrap());
    let types_root = provider.virtual_root_id();
    federation.mount(provider.clone()).await.unwrap();
    federation
        .attach(&NodeId::ROOT, Name::from("nodeTypes"), types_root)
        .await
        .unwrap();

    let session = SessionOverlay::new(federation.clone());
    let root = session.get_node_state(&NodeId::ROOT).await.unwrap();
    assert_eq!(root.child_entry(&Name::from("nodeTypes"), 1).unwrap().id, types_root);

    let loads = pm.loads();
    let types = session.get_node_state(&types_root).await.unwrap();
    assert!(types.child_entry(&Name::from(names::NT_UNSTRUCTURED), 1).is_some());
    for entry in &types.child_entries {
        assert!(session.has_item_state(&ItemId::Node(entry.id)).await.unwrap());
    }
    assert_eq!(pm.loads(), loads);

    // computed content is read-only
    let mut prop = session
        .get_property_state(&PropertyId::new(types_root, Name::from(names::PRIMARY_TYPE)))
        .await
        .unwrap();
    prop.values = vec![InternalValue::Name(Name::from("nt:base"))];
    session.store(ItemState::Property(prop)).await.unwrap();
    assert!(matches!(session.save().await, Err(StateError::ConstraintViolation(_))));
}

fn library(book: NodeId) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<sv:node sv:name="library" xmlns:sv="http://www.strata.dev/sv/1.0">
  <sv:property sv:name="system:primaryType" sv:type="Name"><sv:value>nt:unstructured</sv:value></sv:property>
  <sv:node sv:name="shelf">
    <sv:property sv:name="system:primaryType" sv:type="Name"><sv:value>nt:unstructured</sv:value></sv:property>
    <sv:property sv:name="favorite" sv:type="Reference"><sv:value>{book}</sv:value></sv:property>
    <sv:property sv:name="count" sv:type="Long"><sv:value>1</sv:value></sv:property>
  </sv:node>
  <sv:node sv:name="book">
    <sv:property sv:name="system:primaryType" sv:type="Name"><sv:value>nt:unstructured</sv:value></sv:property>
    <sv:property sv:name="system:mixinTypes" sv:type="Name"><sv:value>mix:referenceable</sv:value></sv:property>
    <sv:property sv:name="system:uuid" sv:type="String"><sv:value>{book}</sv:value></sv:property>
  </sv:node>
</sv:node>"#
    )
}

async fn child(states: &dyn ItemStateManager, parent: NodeId, name: &str) -> NodeId {
    let node = states.get_node_state(&parent).await.unwrap();
    node.child_entry(&Name::from(name), 1).unwrap().id
}

#[tokio::test]
async fn test_import_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    let provisional = NodeId::generate();

    let report = {
        let pm = Arc::new(SledPersistenceManager::open(temp.path()).unwrap());
        let base = Arc::new(CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap());
        base.initialize_root(Name::from(names::NT_UNSTRUCTURED)).await.unwrap();

        let tree = sysview::parse(&library(provisional)).unwrap();
        let session = SessionOverlay::new(base.clone());
        Importer::new(Arc::new(StaticNodeTypeRegistry::with_builtins()))
            .import(&session, &NodeId::ROOT, &tree)
            .await
            .unwrap()
    };
    assert_eq!(report.nodes, 3);
    assert!(report.dropped_references.is_empty());

    let pm = Arc::new(SledPersistenceManager::open(temp.path()).unwrap());
    let base = CanonicalStore::open(pm, &StrataConfig::default()).await.unwrap();
    let library = child(&base, NodeId::ROOT, "library").await;
    assert_eq!(Some(library), report.root);

    let book = child(&base, library, "book").await;
    assert_ne!(book, provisional);
    let shelf = child(&base, library, "shelf").await;
    let favorite = base
        .get_property_state(&PropertyId::new(shelf, Name::from("favorite")))
        .await
        .unwrap();
    assert_eq!(favorite.values, vec![InternalValue::Reference(book)]);
    let count = base
        .get_property_state(&PropertyId::new(shelf, Name::from("count")))
        .await
        .unwrap();
    assert_eq!(count.values, vec![InternalValue::Long(1)]);

    let refs = base.get_node_references(&book).await.unwrap();
    assert_eq!(refs.references.len(), 1);
    assert_eq!(refs.references[0].property, favorite.id);
}

#[tokio::test]
async fn test_referenced_node_cannot_be_removed() {
    let base = canonical(Arc::new(MemoryPersistenceManager::new())).await;
    let session = SessionOverlay::new(base.clone());
    let tree = sysview::parse(&library(NodeId::generate())).unwrap();
    let report = Importer::new(Arc::new(StaticNodeTypeRegistry::with_builtins()))
        .import(&session, &NodeId::ROOT, &tree)
        .await
        .unwrap();
    let library = report.root.unwrap();
    let book = child(base.as_ref(), library, "book").await;

    session.destroy(&ItemId::Node(book)).await.unwrap();
    let err = session.save().await.unwrap_err();
    assert!(matches!(err, StateError::ReferentialIntegrity(_)), "{:?}", err);
    assert!(base.has_item_state(&ItemId::Node(book)).await.unwrap());
    session.discard().await;

    // removing the referrer together with the target is allowed
    session.destroy(&ItemId::Node(library)).await.unwrap();
    session.save().await.unwrap();
    assert!(!base.has_item_state(&ItemId::Node(book)).await.unwrap());
    assert!(!base.has_node_references(&book).await.unwrap());
}

//! Obtaining replicas along paths, refreshing and canceling them

use super::test_utils::{eventually, guarded_base, property_of, TestMesh, LIBRARY};
use netmesh::security::{AccessRule, Operation, RuleBasedAccessManager};
use netmesh::transport::SimNetwork;
use netmesh::{AccessSpecification, MeshError, PropertyValue};
use std::sync::Arc;

/// Test that a replica obtained through an intermediary leaves a replica at
/// every hop and receives updates through it
#[tokio::test]
async fn test_replica_through_intermediary() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let (a, b, c) = (mesh.base(0), mesh.base(1), mesh.base(2));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();

    let spec = AccessSpecification::new(vec![b.local().clone(), a.local().clone()], library.clone());
    let at_c = c.access_locally(spec).await.unwrap();
    assert_eq!(at_c.replica().proxy_towards_home.as_ref(), Some(b.local()));

    let at_b = b.find_object(&library).unwrap();
    assert_eq!(at_b.replica().proxy_towards_home.as_ref(), Some(a.local()));
    assert!(at_b.replica().proxies_with_copies.contains(c.local()));
    let at_a = a.find_object(&library).unwrap();
    assert!(at_a.replica().proxies_with_copies.contains(b.local()));
    assert!(!at_a.replica().proxies_with_copies.contains(c.local()));

    a.set_property(&library, "name", "Relayed").await.unwrap();
    eventually("the far replica to see the write", || {
        property_of(c, &library, "name") == Some(PropertyValue::from("Relayed"))
    })
    .await;

    c.set_property(&library, "name", "Backwards").await.unwrap();
    eventually("the home to see the far write", || {
        property_of(a, &library, "name") == Some(PropertyValue::from("Backwards"))
    })
    .await;
    assert_eq!(mesh.lock_holders(&library), 1);
}

/// Test that an access specification can ask for the lock as well
#[tokio::test]
async fn test_access_with_lock() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let library = mesh.base(0).create_object(None, &[LIBRARY]).await.unwrap();

    let object = mesh
        .base(1)
        .access_locally(AccessSpecification::direct(library.clone()).with_lock())
        .await
        .unwrap();
    assert!(object.has_lock());
    assert!(!mesh.base(0).find_object(&library).unwrap().has_lock());
}

/// Test that resynchronizing fetches what a replica missed
#[tokio::test]
async fn test_resynchronize_catches_up() {
    let network = Arc::new(SimNetwork::new());
    let mesh = TestMesh::with_network(network.clone(), &["alpha"]);
    let a = mesh.base(0);
    let rules = Arc::new(RuleBasedAccessManager::new());
    let b = guarded_base(&network, "beta", rules.clone());
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();

    // Beta drops alpha's next update on the floor.
    rules.deny(AccessRule {
        caller: Some(a.local().clone()),
        identifier: Some(library.clone()),
        operation: Some(Operation::Write),
    });
    a.set_property(&library, "name", "Missed").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(property_of(&b, &library, "name"), None);
    rules.clear();

    let changes = b.resynchronize(&[library.clone()]).await.unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(property_of(&b, &library, "name"), Some(PropertyValue::from("Missed")));

    // Nothing left to catch up on.
    assert!(b.resynchronize(&[library.clone()]).await.unwrap().is_empty());
    // The home is authoritative already.
    assert!(a.resynchronize(&[library]).await.unwrap().is_empty());
}

/// Test that a canceled replica is forgotten at both ends
#[tokio::test]
async fn test_cancel_replica() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();
    assert!(a
        .find_object(&library)
        .unwrap()
        .replica()
        .proxies_with_copies
        .contains(b.local()));

    b.cancel_replica(&library).await.unwrap();
    assert!(!b.contains(&library));
    assert!(a
        .find_object(&library)
        .unwrap()
        .replica()
        .proxies_with_copies
        .is_empty());

    // Later writes are not sent to beta any more.
    a.set_property(&library, "name", "Alone").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!b.contains(&library));
}

/// Test that neither the home nor a lock holder can cancel its replica
#[tokio::test]
async fn test_cancel_refused_for_home_and_holder() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();

    let err = a.cancel_replica(&library).await.unwrap_err();
    assert!(matches!(err, MeshError::NotPermitted { .. }));

    b.obtain_object(&library).await.unwrap();
    b.obtain_lock(&library).await.unwrap();
    let err = b.cancel_replica(&library).await.unwrap_err();
    assert!(matches!(err, MeshError::NotPermitted { .. }));
    assert!(b.contains(&library));
}

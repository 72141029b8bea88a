//! Access manager decisions surfacing as errors

use super::test_utils::{guarded_base, TestMesh, LIBRARY};
use netmesh::security::{AccessRule, Operation, RuleBasedAccessManager};
use netmesh::transport::SimNetwork;
use netmesh::MeshError;
use std::sync::Arc;

/// Test that a refused replica request surfaces as NotPermitted at the caller
#[tokio::test]
async fn test_refused_replica_is_not_permitted() {
    let network = Arc::new(SimNetwork::new());
    let rules = Arc::new(RuleBasedAccessManager::new());
    let a = guarded_base(&network, "alpha", rules.clone());
    let mesh = TestMesh::with_network(network, &["beta"]);
    let b = mesh.base(0);
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();

    rules.deny(AccessRule {
        caller: Some(b.local().clone()),
        identifier: Some(library.clone()),
        operation: Some(Operation::Read),
    });
    let err = b.obtain_object(&library).await.unwrap_err();
    match err {
        MeshError::NotPermitted {
            identifier,
            operation,
            ..
        } => {
            assert_eq!(identifier, library);
            assert_eq!(operation, Operation::Read);
        }
        other => panic!("expected NotPermitted, got {:?}", other),
    }
    assert!(!b.contains(&library));
    assert!(a
        .find_object(&library)
        .unwrap()
        .replica()
        .proxies_with_copies
        .is_empty());

    rules.clear();
    b.obtain_object(&library).await.unwrap();
}

/// Test that local writes are checked before anything else happens
#[tokio::test]
async fn test_local_write_denied() {
    let network = Arc::new(SimNetwork::new());
    let rules = Arc::new(RuleBasedAccessManager::new());
    let a = guarded_base(&network, "alpha", rules.clone());
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();

    rules.deny(AccessRule {
        caller: Some(a.local().clone()),
        operation: Some(Operation::Write),
        ..AccessRule::default()
    });
    let err = a.set_property(&library, "name", "Closed").await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::NotPermitted {
            operation: Operation::Write,
            ..
        }
    ));
    assert!(a.find_object(&library).unwrap().property("name").is_none());
}

/// Test that a denied lock request leaves the lock where it was
#[tokio::test]
async fn test_lock_request_denied_by_rule() {
    let network = Arc::new(SimNetwork::new());
    let rules = Arc::new(RuleBasedAccessManager::new());
    let a = guarded_base(&network, "alpha", rules.clone());
    let mesh = TestMesh::with_network(network, &["beta"]);
    let b = mesh.base(0);
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();

    rules.deny(AccessRule {
        caller: Some(b.local().clone()),
        operation: Some(Operation::ObtainLock),
        ..AccessRule::default()
    });
    let err = b.set_property(&library, "name", "Mine").await.unwrap_err();
    assert!(matches!(err, MeshError::LockUnavailable { .. }));
    assert!(a.find_object(&library).unwrap().has_lock());
    assert!(!b.find_object(&library).unwrap().has_lock());
}

/// Test that a change from a peer without write permission is ignored
#[tokio::test]
async fn test_unpermitted_remote_change_is_ignored() {
    let network = Arc::new(SimNetwork::new());
    let rules = Arc::new(RuleBasedAccessManager::new());
    let a = guarded_base(&network, "alpha", rules.clone());
    let mesh = TestMesh::with_network(network, &["beta"]);
    let b = mesh.base(0);
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();
    b.obtain_lock(&library).await.unwrap();

    rules.deny(AccessRule {
        caller: Some(b.local().clone()),
        operation: Some(Operation::Write),
        ..AccessRule::default()
    });
    b.set_property(&library, "name", "Sneaky").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(a.find_object(&library).unwrap().property("name").is_none());
}

//! Lock migration between replicas

use super::test_utils::{eventually, property_of, TestMesh, COUNTER};
use netmesh::{LockFailure, MeshError, PropertyValue, PushOutcome};

/// Test that a lock pinned by an open transaction is not handed out
#[tokio::test]
async fn test_open_transaction_keeps_lock() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let (b, c) = (mesh.base(1), mesh.base(2));
    let counter = mesh.base(0).create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    c.obtain_object(&counter).await.unwrap();

    let mut tx = b.begin_transaction().await;
    tx.set_property(&counter, "count", 1_i64).await.unwrap();
    assert!(b.find_object(&counter).unwrap().has_lock());

    let err = c.obtain_lock(&counter).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::LockUnavailable {
            cause: LockFailure::Denied,
            ..
        }
    ));
    assert_eq!(mesh.lock_holders(&counter), 1);

    tx.commit().await.unwrap();
    c.obtain_lock(&counter).await.unwrap();
    assert!(c.find_object(&counter).unwrap().has_lock());
    assert!(!b.find_object(&counter).unwrap().has_lock());
    assert_eq!(mesh.lock_holders(&counter), 1);
    // The lock brought the latest state along.
    assert_eq!(property_of(c, &counter, "count"), Some(PropertyValue::from(1_i64)));
}

/// Test that concurrent lock requests leave exactly one holder
#[tokio::test]
async fn test_concurrent_requests_leave_one_holder() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma", "delta"]);
    let counter = mesh.base(0).create_object(None, &[COUNTER]).await.unwrap();
    for base in &mesh.bases[1..] {
        base.obtain_object(&counter).await.unwrap();
    }

    let (b, c, d) = tokio::join!(
        mesh.base(1).obtain_lock(&counter),
        mesh.base(2).obtain_lock(&counter),
        mesh.base(3).obtain_lock(&counter),
    );
    let granted = [b.is_ok(), c.is_ok(), d.is_ok()];
    assert!(granted.iter().any(|ok| *ok));
    assert_eq!(mesh.lock_holders(&counter), 1);
    assert_eq!(mesh.home_replicas(&counter), 1);
}

/// Test that every host can take its turn incrementing a shared counter
#[tokio::test]
async fn test_lock_follows_writers() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let counter = mesh.base(0).create_object(None, &[COUNTER]).await.unwrap();
    mesh.base(0).set_property(&counter, "count", 0_i64).await.unwrap();

    for round in 0..6 {
        let base = mesh.base((round + 1) % 3);
        base.obtain_object(&counter).await.unwrap();
        base.obtain_lock(&counter).await.unwrap();
        let current = property_of(base, &counter, "count")
            .and_then(|v| v.as_i64())
            .unwrap();
        base.set_property(&counter, "count", current + 1).await.unwrap();
        assert_eq!(mesh.lock_holders(&counter), 1);
    }

    eventually("every replica to count to six", || {
        mesh.bases
            .iter()
            .all(|base| property_of(base, &counter, "count") == Some(PropertyValue::from(6_i64)))
    })
    .await;
}

/// Test that a pushed lock arrives once and cannot be pushed again
#[tokio::test]
async fn test_push_lock_is_acknowledged_once() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    a.set_property(&counter, "count", 7_i64).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    let before = a.find_object(&counter).unwrap().lock_epoch().clone();

    let outcome = a.push_lock(&counter, b.local()).await.unwrap();
    assert_eq!(outcome, PushOutcome::Ack);
    let at_b = b.find_object(&counter).unwrap();
    assert!(at_b.has_lock());
    assert!(at_b.lock_epoch().is_newer_than(&before));
    assert!(!a.find_object(&counter).unwrap().has_lock());

    let again = a.push_lock(&counter, b.local()).await.unwrap_err();
    assert!(matches!(again, MeshError::LockRequired(_)));
    assert_eq!(mesh.lock_holders(&counter), 1);
}

/// Test that a replica refusing to give up its lock keeps it
#[tokio::test]
async fn test_holder_may_refuse_to_give_up_lock() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    a.set_give_up_lock(&counter, false).unwrap();

    let err = b.obtain_lock(&counter).await.unwrap_err();
    assert!(matches!(err, MeshError::LockUnavailable { .. }));
    assert!(a.find_object(&counter).unwrap().has_lock());

    a.set_give_up_lock(&counter, true).unwrap();
    b.obtain_lock(&counter).await.unwrap();
    assert!(b.find_object(&counter).unwrap().has_lock());
}

/// Test that only a reclaim by the home takes a staged object's lock away,
/// and the open transaction then commits nothing
#[tokio::test]
async fn test_reclaim_during_open_transaction_fails_commit() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();

    let mut tx = b.begin_transaction().await;
    tx.set_property(&counter, "count", 1_i64).await.unwrap();

    // The home cannot get a write in while the lock is pinned at beta.
    let err = a.set_property(&counter, "count", 5_i64).await.unwrap_err();
    assert!(matches!(err, MeshError::LockUnavailable { .. }));
    assert_eq!(property_of(b, &counter, "count"), None);

    a.reclaim_lock(&counter).unwrap();
    a.set_property(&counter, "count", 7_i64).await.unwrap();
    eventually("beta to apply the home's write", || {
        property_of(b, &counter, "count") == Some(PropertyValue::from(7_i64))
    })
    .await;
    assert!(!b.find_object(&counter).unwrap().has_lock());

    let err = tx.commit().await.unwrap_err();
    assert!(matches!(err, MeshError::LockRequired(_)));
    assert_eq!(property_of(b, &counter, "count"), Some(PropertyValue::from(7_i64)));
    assert_eq!(property_of(a, &counter, "count"), Some(PropertyValue::from(7_i64)));
    assert_eq!(mesh.lock_holders(&counter), 1);
}

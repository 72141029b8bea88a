//! Taking a lock back from a holder that went silent

use super::test_utils::{eventually, property_of, TestMesh, COUNTER};
use netmesh::PropertyValue;
use std::time::Duration;

/// Test that the home reclaims the lock from a silent holder and writes
/// without waiting for it
#[tokio::test]
async fn test_reclaim_after_silence() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    b.set_property(&counter, "count", 2_i64).await.unwrap();
    eventually("home to see the write", || {
        property_of(a, &counter, "count") == Some(PropertyValue::from(2_i64))
    })
    .await;

    // Nothing has been silent long enough yet.
    let (reclaimed, _) = a.reclaim_stale_locks();
    assert!(reclaimed.is_empty());

    mesh.network.partition(a.local(), b.local());
    tokio::time::sleep(Duration::from_millis(400)).await;

    let (reclaimed, warnings) = a.reclaim_stale_locks();
    assert_eq!(reclaimed, vec![counter.clone()]);
    assert_eq!(warnings.len(), 1);
    assert!(a.find_object(&counter).unwrap().has_lock());

    let write = a.set_property(&counter, "count", 10_i64);
    tokio::time::timeout(Duration::from_millis(100), write)
        .await
        .expect("write after reclaim must not wait for the old holder")
        .unwrap();
    assert_eq!(property_of(a, &counter, "count"), Some(PropertyValue::from(10_i64)));
}

/// Test that a write from the old holder is refused after a reclaim and the
/// old holder is corrected once the partition heals
#[tokio::test]
async fn test_stale_holder_is_corrected() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    b.set_property(&counter, "count", 2_i64).await.unwrap();
    eventually("home to see the write", || {
        property_of(a, &counter, "count") == Some(PropertyValue::from(2_i64))
    })
    .await;

    mesh.network.partition(a.local(), b.local());
    tokio::time::sleep(Duration::from_millis(400)).await;
    let (reclaimed, _) = a.reclaim_stale_locks();
    assert_eq!(reclaimed.len(), 1);
    mesh.network.heal(a.local(), b.local());

    // Beta never heard of the reclaim and still writes.
    assert!(b.find_object(&counter).unwrap().has_lock());
    b.set_property(&counter, "count", 99_i64).await.unwrap();

    // The correction waits behind the reclaim lost in the partition until
    // the gap is given up on.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while b.find_object(&counter).unwrap().has_lock() {
        assert!(tokio::time::Instant::now() < deadline, "old holder was never corrected");
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.run_maintenance().await;
    }

    assert_eq!(property_of(a, &counter, "count"), Some(PropertyValue::from(2_i64)));
    assert_eq!(property_of(b, &counter, "count"), Some(PropertyValue::from(2_i64)));
    assert_eq!(mesh.lock_holders(&counter), 1);
    assert!(a.find_object(&counter).unwrap().has_lock());
}

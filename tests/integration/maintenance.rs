//! Heartbeats, ceasing communications and the maintenance task

use super::test_utils::{eventually, TestMesh, LIBRARY};
use std::time::Duration;

/// Test that idle proxies send heartbeats and busy ones do not
#[tokio::test]
async fn test_heartbeats_after_idle_interval() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();

    assert_eq!(a.send_heartbeats(), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(a.send_heartbeats(), 1);

    let proxy = b.proxy(a.local()).unwrap();
    eventually("beta to hear the heartbeat", || {
        !proxy.is_silent_for(Duration::from_millis(100))
    })
    .await;
}

/// Test that ceasing communications kills the partner's proxy, which is
/// collected once nothing refers to it
#[tokio::test]
async fn test_cease_communications_and_collection() {
    let mut mesh = TestMesh::new(&["alpha", "beta"]);
    let b = mesh.bases.pop().unwrap();
    let a = mesh.base(0);
    let beta = b.local().clone();
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();

    b.cease_communications();
    eventually("alpha to give up on beta", || {
        a.proxy(&beta).map(|p| p.is_dead()).unwrap_or(false)
    })
    .await;
    drop(b);

    // The library still has a copy at beta.
    assert!(a.collect_dead_proxies().is_empty());
    assert!(a.proxy(&beta).is_some());

    let report = a.delete_object(&library).await.unwrap();
    assert!(!report.is_fully_propagated());
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(a.sweep_tombstones().len(), 1);
    // Nothing is left to send to beta.
    assert!(a.retry_undelivered().await.is_empty());
    assert_eq!(a.collect_dead_proxies(), vec![beta.clone()]);
    assert!(a.proxy(&beta).is_none());
}

/// Test that the spawned maintenance task reclaims a lock from a silent holder
#[tokio::test]
async fn test_spawned_maintenance_reclaims() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();
    b.obtain_lock(&library).await.unwrap();

    mesh.network.partition(a.local(), b.local());
    let task = a.spawn_maintenance();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !a.find_object(&library).unwrap().has_lock() {
        assert!(tokio::time::Instant::now() < deadline, "lock was never reclaimed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    task.abort();
    assert_eq!(mesh.home_replicas(&library), 1);
}

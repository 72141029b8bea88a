//! Per-channel ordering over a network that reorders frames

use super::test_utils::{eventually, property_of, TestMesh, COUNTER};
use netmesh::transport::SimNetwork;
use netmesh::{Change, PropertyValue};
use std::sync::Arc;
use std::time::Duration;

/// Test that a replica applies a writer's changes in the order they were
/// committed, even when the network delivers them out of order
#[tokio::test]
async fn test_changes_apply_in_commit_order_under_jitter() {
    let network = Arc::new(SimNetwork::new());
    let mesh = TestMesh::with_network(network.clone(), &["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();

    let mut events = b.subscribe();
    network.set_jitter(Duration::from_millis(20));
    for value in 1..=20_i64 {
        a.set_property(&counter, "count", value).await.unwrap();
    }

    eventually("replica to catch up", || {
        property_of(b, &counter, "count") == Some(PropertyValue::from(20_i64))
    })
    .await;

    let mut seen = Vec::new();
    while let Ok(changes) = events.try_recv() {
        for change in changes {
            if let Change::PropertyChanged {
                new: Some(value), ..
            } = change
            {
                seen.push(value.as_i64().unwrap());
            }
        }
    }
    assert_eq!(seen, (1..=20).collect::<Vec<i64>>());
}

/// Test that each lock transfer brings the latest state along when frames
/// are reordered
#[tokio::test]
async fn test_lock_transfer_carries_latest_state_under_jitter() {
    let network = Arc::new(SimNetwork::with_jitter(Duration::from_millis(15)));
    let mesh = TestMesh::with_network(network, &["alpha", "beta", "gamma"]);
    let counter = mesh.base(0).create_object(None, &[COUNTER]).await.unwrap();
    mesh.base(0).set_property(&counter, "count", 0_i64).await.unwrap();

    for round in 0..6 {
        let base = mesh.base((round + 1) % 3);
        base.obtain_object(&counter).await.unwrap();
        base.obtain_lock(&counter).await.unwrap();
        let current = property_of(base, &counter, "count")
            .and_then(|v| v.as_i64())
            .unwrap();
        assert_eq!(current, round as i64);
        base.set_property(&counter, "count", current + 1).await.unwrap();
    }
    assert_eq!(mesh.lock_holders(&counter), 1);
}

fn counts_seen(events: &mut tokio::sync::broadcast::Receiver<netmesh::ChangeSet>) -> Vec<i64> {
    let mut seen = Vec::new();
    while let Ok(changes) = events.try_recv() {
        for change in changes {
            if let Change::PropertyChanged {
                new: Some(value), ..
            } = change
            {
                seen.push(value.as_i64().unwrap());
            }
        }
    }
    seen
}

/// Test that every change delivered twice is applied once
#[tokio::test]
async fn test_replayed_frames_apply_once() {
    let network = Arc::new(SimNetwork::new());
    let mesh = TestMesh::with_network(network.clone(), &["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();

    let mut events = b.subscribe();
    network.duplicate(a.local(), b.local());
    for value in 1..=10_i64 {
        a.set_property(&counter, "count", value).await.unwrap();
    }
    eventually("replica to catch up", || {
        property_of(b, &counter, "count") == Some(PropertyValue::from(10_i64))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(counts_seen(&mut events), (1..=10).collect::<Vec<i64>>());
}

/// Test that messages released from a stalled reorder buffer stay in order
/// with the frames that keep arriving
#[tokio::test]
async fn test_stalled_messages_stay_in_order_with_later_frames() {
    let network = Arc::new(SimNetwork::new());
    let mesh = TestMesh::with_network(network.clone(), &["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let counter = a.create_object(None, &[COUNTER]).await.unwrap();
    b.obtain_object(&counter).await.unwrap();
    let mut events = b.subscribe();

    for value in 1..=3_i64 {
        a.set_property(&counter, "count", value).await.unwrap();
    }
    network.partition(a.local(), b.local());
    a.set_property(&counter, "count", 4_i64).await.unwrap();
    network.heal(a.local(), b.local());

    let writer = {
        let a = a.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            for value in 5..=16_i64 {
                a.set_property(&counter, "count", value).await.unwrap();
                tokio::time::sleep(Duration::from_millis(60)).await;
            }
        })
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while property_of(b, &counter, "count") != Some(PropertyValue::from(16_i64)) {
        assert!(tokio::time::Instant::now() < deadline, "replica never caught up");
        b.run_maintenance().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    writer.await.unwrap();

    let seen = counts_seen(&mut events);
    assert!(!seen.contains(&4));
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "out of order: {:?}", seen);
    assert_eq!(seen.last(), Some(&16));
}

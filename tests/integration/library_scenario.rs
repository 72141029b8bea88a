//! A library and its tag replicated between two hosts

use super::test_utils::{eventually, net, object_id, property_of, TestMesh, LIBRARY, TAG, TAGGED};
use netmesh::PropertyValue;

/// Test that a tag written on a replica ends up at its home, with the lock
/// staying at the writer
#[tokio::test]
async fn test_tag_written_on_replica_reaches_home() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = object_id(a.local(), "library");
    let tag = object_id(a.local(), "tag:funny");

    let mut tx = a.begin_transaction().await;
    tx.create_object(Some(library.clone()), &[LIBRARY]).await.unwrap();
    tx.set_property(&library, "name", "Central").await.unwrap();
    tx.create_object(Some(tag.clone()), &[TAG]).await.unwrap();
    tx.bless_relationship(&library, &tag, TAGGED).await.unwrap();
    tx.commit().await.unwrap();

    let replica = b.obtain_object(&library).await.unwrap();
    assert!(!replica.is_home_replica());
    assert!(!replica.has_lock());
    assert_eq!(replica.replica().proxy_towards_home.as_ref(), Some(a.local()));
    assert!(replica.snapshot().is_related_to(&tag));
    assert_eq!(replica.property("name"), Some(&PropertyValue::from("Central")));

    b.set_property(&tag, "label", "funny").await.unwrap();
    let at_b = b.find_object(&tag).unwrap();
    assert!(at_b.has_lock());
    assert!(!at_b.is_home_replica());

    eventually("home to see the new label", || {
        property_of(a, &tag, "label") == Some(PropertyValue::from("funny"))
    })
    .await;
    let at_a = a.find_object(&tag).unwrap();
    assert!(at_a.is_home_replica());
    assert!(!at_a.has_lock());
    assert_eq!(at_a.replica().proxy_towards_lock.as_ref(), Some(b.local()));

    // The lock stays with the writer for further writes.
    b.set_property(&tag, "label", "funnier").await.unwrap();
    assert!(b.find_object(&tag).unwrap().has_lock());
    eventually("second write to arrive", || {
        property_of(a, &tag, "label") == Some(PropertyValue::from("funnier"))
    })
    .await;
}

/// Test that exactly one replica is the home replica however many copies exist
#[tokio::test]
async fn test_single_home_replica_across_hosts() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let library = mesh.base(0).create_object(None, &[LIBRARY]).await.unwrap();

    mesh.base(1).obtain_object(&library).await.unwrap();
    mesh.base(2).obtain_object(&library).await.unwrap();
    mesh.base(2).set_property(&library, "name", "Annex").await.unwrap();

    assert_eq!(mesh.home_replicas(&library), 1);
    assert_eq!(mesh.lock_holders(&library), 1);
    assert!(mesh.base(0).find_object(&library).unwrap().is_home_replica());
    assert!(mesh.base(2).find_object(&library).unwrap().has_lock());
}

/// Test that a write on one replica reaches a sibling replica through the home
#[tokio::test]
async fn test_changes_travel_through_home_to_siblings() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let library = mesh.base(0).create_object(None, &[LIBRARY]).await.unwrap();
    mesh.base(1).obtain_object(&library).await.unwrap();
    mesh.base(2).obtain_object(&library).await.unwrap();

    mesh.base(1).set_property(&library, "name", "Branch").await.unwrap();

    let expected = Some(PropertyValue::from("Branch"));
    eventually("every replica to see the write", || {
        mesh.bases
            .iter()
            .all(|base| property_of(base, &library, "name") == expected)
    })
    .await;
}

/// Test that asking for an object of an unknown host fails cleanly
#[tokio::test]
async fn test_obtain_from_unknown_host_fails() {
    let mesh = TestMesh::new(&["alpha"]);
    let missing = object_id(&net("sim://nowhere"), "library");
    assert!(mesh.base(0).obtain_object(&missing).await.is_err());
    assert!(!mesh.base(0).contains(&missing));
}

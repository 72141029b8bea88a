//! Moving the home replica between hosts

use super::test_utils::{eventually, property_of, TestMesh, LIBRARY};
use netmesh::{MeshError, PropertyValue};

/// Test that home status moves only when the home agrees, and stays unique
#[tokio::test]
async fn test_home_migration_keeps_one_home() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let (a, b) = (mesh.base(0), mesh.base(1));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    b.obtain_object(&library).await.unwrap();

    let refused = b.obtain_home_replica(&library).await.unwrap_err();
    assert!(matches!(refused, MeshError::Denied(_)));
    assert!(a.find_object(&library).unwrap().is_home_replica());
    assert_eq!(mesh.home_replicas(&library), 1);

    a.set_give_up_home(&library, true).unwrap();
    b.obtain_home_replica(&library).await.unwrap();

    let at_a = a.find_object(&library).unwrap();
    let at_b = b.find_object(&library).unwrap();
    assert!(at_b.is_home_replica());
    assert!(at_b.has_lock());
    assert!(!at_a.is_home_replica());
    assert_eq!(at_a.replica().proxy_towards_home.as_ref(), Some(b.local()));
    assert_eq!(mesh.home_replicas(&library), 1);

    // Asking again is a no-op.
    b.obtain_home_replica(&library).await.unwrap();
    assert_eq!(mesh.home_replicas(&library), 1);
}

/// Test that a replica obtained through the old home still reaches the lock
/// after the home moved
#[tokio::test]
async fn test_lock_requests_route_to_new_home() {
    let mesh = TestMesh::new(&["alpha", "beta", "gamma"]);
    let (a, b, c) = (mesh.base(0), mesh.base(1), mesh.base(2));
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    a.set_give_up_home(&library, true).unwrap();
    b.obtain_object(&library).await.unwrap();
    b.obtain_home_replica(&library).await.unwrap();
    b.set_property(&library, "name", "Moved").await.unwrap();

    // Gamma asks the object's original host, which is no longer home.
    let replica = c.obtain_object(&library).await.unwrap();
    assert_eq!(replica.replica().proxy_towards_home.as_ref(), Some(a.local()));

    c.set_property(&library, "name", "Gamma").await.unwrap();
    assert!(c.find_object(&library).unwrap().has_lock());
    assert_eq!(mesh.lock_holders(&library), 1);
    assert_eq!(mesh.home_replicas(&library), 1);
    assert!(b.find_object(&library).unwrap().is_home_replica());

    let expected = Some(PropertyValue::from("Gamma"));
    eventually("the new home to see gamma's write", || {
        property_of(b, &library, "name") == expected
    })
    .await;
}

/// Test that home status cannot be requested without a local replica
#[tokio::test]
async fn test_home_request_without_replica_fails() {
    let mesh = TestMesh::new(&["alpha", "beta"]);
    let library = mesh.base(0).create_object(None, &[LIBRARY]).await.unwrap();
    let err = mesh.base(1).obtain_home_replica(&library).await.unwrap_err();
    assert!(matches!(err, MeshError::NotFound(_)));
    assert_eq!(mesh.home_replicas(&library), 1);
}

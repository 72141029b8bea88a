//! Persistence of replicas through the storage collaborator

use super::test_utils::{fast_config, library_registry, net, property_of, TestMesh, LIBRARY};
use netmesh::config::{NetMeshConfig, StorageBackend, StorageConfig};
use netmesh::storage::{MeshStore, SledMeshStore};
use netmesh::transport::SimNetwork;
use netmesh::{NetMeshBase, PropertyValue};
use std::sync::Arc;
use tempfile::TempDir;

/// Test that objects survive a restart of their mesh base on a sled store
#[tokio::test]
async fn test_sled_store_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledMeshStore::new(temp_dir.path().join("mesh")).unwrap());
    let network = Arc::new(SimNetwork::new());
    let local = net("sim://alpha");

    let library = {
        let base = NetMeshBase::builder(local.clone(), network.clone())
            .registry(library_registry())
            .config(fast_config())
            .storage(store.clone())
            .build()
            .unwrap();
        let library = base.create_object(None, &[LIBRARY]).await.unwrap();
        base.set_property(&library, "name", "Durable").await.unwrap();
        library
    };
    store.flush().unwrap();
    assert!(store.contains(&library).unwrap());
    assert_eq!(store.list_all().unwrap().len(), 1);

    let restarted = NetMeshBase::builder(local, network)
        .registry(library_registry())
        .config(fast_config())
        .storage(store.clone())
        .build()
        .unwrap();
    let object = restarted.find_object(&library).unwrap();
    assert!(object.is_home_replica());
    assert!(object.has_lock());
    assert!(object.types().contains(LIBRARY));
    assert_eq!(object.property("name"), Some(&PropertyValue::from("Durable")));
}

/// Test that a replica and its routing survive a restart
#[tokio::test]
async fn test_replica_routing_is_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledMeshStore::new(temp_dir.path().join("mesh")).unwrap());
    let network = Arc::new(SimNetwork::new());
    let mesh = TestMesh::with_network(network.clone(), &["alpha"]);
    let a = mesh.base(0);
    let library = a.create_object(None, &[LIBRARY]).await.unwrap();
    a.set_property(&library, "name", "Remote").await.unwrap();

    let beta = net("sim://beta");
    {
        let b = NetMeshBase::builder(beta.clone(), network.clone())
            .registry(library_registry())
            .config(fast_config())
            .storage(store.clone())
            .build()
            .unwrap();
        b.obtain_object(&library).await.unwrap();
    }

    let b = NetMeshBase::builder(beta, network)
        .registry(library_registry())
        .config(fast_config())
        .storage(store)
        .build()
        .unwrap();
    let object = b.find_object(&library).unwrap();
    assert!(!object.is_home_replica());
    assert_eq!(object.replica().proxy_towards_home.as_ref(), Some(a.local()));
    assert_eq!(property_of(&b, &library, "name"), Some(PropertyValue::from("Remote")));
}

/// Test that deleting an object removes it from storage
#[tokio::test]
async fn test_delete_removes_from_storage() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledMeshStore::new(temp_dir.path().join("mesh")).unwrap());
    let base = NetMeshBase::builder(net("sim://alpha"), Arc::new(SimNetwork::new()))
        .registry(library_registry())
        .storage(store.clone())
        .build()
        .unwrap();
    let library = base.create_object(None, &[LIBRARY]).await.unwrap();
    assert!(store.load_object(&library).unwrap().is_some());

    base.delete_object(&library).await.unwrap();
    assert!(store.load_object(&library).unwrap().is_none());
    assert!(!base.contains(&library));
}

/// Test that a mesh base set up from configuration uses the sled backend
#[tokio::test]
async fn test_mesh_base_from_config_uses_sled() {
    let temp_dir = TempDir::new().unwrap();
    let config = NetMeshConfig {
        network_identifier: Some("sim://configured".to_string()),
        storage: StorageConfig {
            backend: StorageBackend::Sled,
            path: temp_dir.path().join("nested").join("store"),
        },
        mesh: fast_config(),
        ..NetMeshConfig::default()
    };
    let base = NetMeshBase::from_config(&config, Arc::new(SimNetwork::new())).unwrap();
    assert_eq!(base.local(), &net("sim://configured"));

    let identifier = base.create_object(None, &[]).await.unwrap();
    assert!(base.find_object(&identifier).unwrap().is_home_replica());
    assert!(temp_dir.path().join("nested").join("store").exists());
}

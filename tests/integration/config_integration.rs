//! Integration tests for Configuration System

use super::test_utils::net;
use netmesh::config::{ConfigLoader, StorageBackend, ValidationError};
use netmesh::transport::SimNetwork;
use netmesh::{MeshError, NetMeshBase};
use std::sync::Arc;
use tempfile::TempDir;

use crate::integration::with_xdg_env;

#[test]
fn test_config_file_sets_mesh_timing() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("test_config.toml");

    std::fs::write(
        &config_file,
        r#"
network_identifier = "sim://alpha"

[mesh]
lock_timeout_ms = 750
liveness_threshold_ms = 4000
heartbeat_interval_ms = 1000
give_up_home_replica = true

[storage]
backend = "sled"
path = "/tmp/netmesh-test-store"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.mesh.lock_timeout_ms, 750);
    assert_eq!(config.mesh.liveness_threshold_ms, 4_000);
    assert!(config.mesh.give_up_home_replica);
    // Unset values keep their defaults.
    assert_eq!(config.mesh.request_timeout_ms, 10_000);
    assert!(config.mesh.give_up_lock);
    assert_eq!(config.storage.backend, StorageBackend::Sled);
    assert_eq!(config.network_identifier().unwrap(), Some(net("sim://alpha")));
}

#[test]
fn test_validation_reports_every_problem() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("bad.toml");
    std::fs::write(
        &config_file,
        r#"
network_identifier = "not a network"

[mesh]
lock_timeout_ms = 0
liveness_threshold_ms = 100
heartbeat_interval_ms = 200
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    let errors = config.validate().unwrap_err();
    assert_eq!(errors.len(), 3);
    assert!(errors
        .iter()
        .any(|e| matches!(e, ValidationError::Mesh(msg) if msg.contains("lock_timeout_ms"))));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ValidationError::Mesh(msg) if msg.contains("liveness_threshold_ms"))));
    assert!(errors
        .iter()
        .any(|e| matches!(e, ValidationError::Identity(_))));
}

#[tokio::test]
async fn test_mesh_base_rejects_invalid_timing() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("timing.toml");
    std::fs::write(
        &config_file,
        r#"
network_identifier = "sim://alpha"

[mesh]
liveness_threshold_ms = 10
heartbeat_interval_ms = 50
"#,
    )
    .unwrap();
    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    let result = NetMeshBase::from_config(&config, Arc::new(SimNetwork::new()));
    assert!(matches!(result, Err(MeshError::Config(_))));
}

#[test]
fn test_missing_network_identifier_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("anonymous.toml");
    std::fs::write(&config_file, "[mesh]\nlock_timeout_ms = 900\n").unwrap();

    let config = ConfigLoader::load_from_file(&config_file).unwrap();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let result = runtime.block_on(async { NetMeshBase::from_config(&config, Arc::new(SimNetwork::new())) });
    assert!(matches!(result, Err(MeshError::Config(_))));
}

#[test]
fn test_layered_sources_take_precedence_in_order() {
    let test_dir = TempDir::new().unwrap();
    with_xdg_env(&test_dir, || {
        let user_dir = test_dir.path().join("netmesh");
        std::fs::create_dir_all(&user_dir).unwrap();
        std::fs::write(
            user_dir.join("config.toml"),
            "[mesh]\nlock_timeout_ms = 1000\nrequest_timeout_ms = 2000\nevent_buffer = 32\n",
        )
        .unwrap();

        let project = test_dir.path().join("project");
        std::fs::create_dir_all(project.join("config")).unwrap();
        std::fs::write(
            project.join("config").join("config.toml"),
            "[mesh]\nrequest_timeout_ms = 3000\nevent_buffer = 64\n",
        )
        .unwrap();

        std::env::set_var("NETMESH__MESH__EVENT_BUFFER", "128");
        let loaded = ConfigLoader::load(&project);
        std::env::remove_var("NETMESH__MESH__EVENT_BUFFER");

        let config = loaded.unwrap();
        assert_eq!(config.mesh.lock_timeout_ms, 1_000);
        assert_eq!(config.mesh.request_timeout_ms, 3_000);
        assert_eq!(config.mesh.event_buffer, 128);
    });
}

#[test]
fn test_missing_config_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = ConfigLoader::load_from_file(&temp_dir.path().join("absent.toml"));
    assert!(matches!(result, Err(MeshError::Config(_))));
}

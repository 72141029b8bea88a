//! Shared test utilities for integration tests
//!
//! Mesh bases wired to one simulated network, a small type schema, and
//! isolated XDG directories for configuration tests.

use netmesh::config::MeshConfig;
use netmesh::model::{EntityType, RelationshipType};
use netmesh::security::RuleBasedAccessManager;
use netmesh::transport::SimNetwork;
use netmesh::{MeshObjectIdentifier, NetMeshBase, NetworkIdentifier, PropertyValue, TypeRegistry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Global mutex to serialize XDG environment variable access across all tests
/// This prevents race conditions when tests run in parallel
static XDG_ENV_MUTEX: Mutex<()> = Mutex::new(());

/// Environment variable state to restore after test
struct EnvState {
    home: Option<String>,
    xdg_config_home: Option<String>,
    xdg_data_home: Option<String>,
}

impl EnvState {
    fn capture() -> Self {
        Self {
            home: std::env::var("HOME").ok(),
            xdg_config_home: std::env::var("XDG_CONFIG_HOME").ok(),
            xdg_data_home: std::env::var("XDG_DATA_HOME").ok(),
        }
    }

    fn restore(self) {
        if let Some(orig) = self.home {
            std::env::set_var("HOME", orig);
        } else {
            std::env::remove_var("HOME");
        }

        if let Some(orig) = self.xdg_config_home {
            std::env::set_var("XDG_CONFIG_HOME", orig);
        } else {
            std::env::remove_var("XDG_CONFIG_HOME");
        }

        if let Some(orig) = self.xdg_data_home {
            std::env::set_var("XDG_DATA_HOME", orig);
        } else {
            std::env::remove_var("XDG_DATA_HOME");
        }
    }
}

/// Set up isolated XDG directories for a test with automatic cleanup
///
/// This function:
/// - Creates isolated XDG_CONFIG_HOME and XDG_DATA_HOME directories in the temp dir
/// - Sets HOME to ensure fallback paths work correctly
/// - Automatically restores original environment variables after the test
/// - Uses a global mutex to prevent race conditions in parallel test execution
///
/// # Example
/// ```
/// use tempfile::TempDir;
/// use crate::integration::with_xdg_env;
///
/// let test_dir = TempDir::new().unwrap();
/// with_xdg_env(&test_dir, || {
///     // Your test code here
///     // XDG_CONFIG_HOME and XDG_DATA_HOME are set to test_dir
/// });
/// // Environment automatically restored
/// ```
pub fn with_xdg_env<F, R>(test_dir: &TempDir, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = XDG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    let env_state = EnvState::capture();

    let test_config_home = test_dir.path().to_path_buf();
    let test_data_home = test_dir.path().join("data");
    let test_home = test_dir.path().join("home");

    std::fs::create_dir_all(&test_data_home).unwrap();
    std::fs::create_dir_all(&test_home).unwrap();

    std::env::set_var("HOME", test_home.to_str().unwrap());
    std::env::set_var("XDG_CONFIG_HOME", test_config_home.to_str().unwrap());
    std::env::set_var("XDG_DATA_HOME", test_data_home.to_str().unwrap());

    let result = f();

    env_state.restore();

    result
}

pub const LIBRARY: &str = "Library";
pub const TAG: &str = "Tag";
pub const TAGGED: &str = "Tagged";
pub const COUNTER: &str = "Counter";

pub fn net(raw: &str) -> NetworkIdentifier {
    NetworkIdentifier::parse(raw).unwrap()
}

pub fn object_id(network: &NetworkIdentifier, local_id: &str) -> MeshObjectIdentifier {
    MeshObjectIdentifier::new(network, local_id).unwrap()
}

/// Timeouts short enough for tests.
pub fn fast_config() -> MeshConfig {
    MeshConfig {
        lock_timeout_ms: 500,
        request_timeout_ms: 500,
        liveness_threshold_ms: 300,
        heartbeat_interval_ms: 100,
        delete_propagation_timeout_ms: 200,
        maintenance_interval_ms: 1_000,
        ..MeshConfig::default()
    }
}

/// Libraries, tags, the relationship between them, and a counter.
pub fn library_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register_entity_type(EntityType::new(LIBRARY).with_property("name"))
        .register_entity_type(
            EntityType::new(TAG)
                .with_property("label")
                .with_default("color", PropertyValue::from("grey")),
        )
        .register_entity_type(EntityType::new(COUNTER).with_property("count"))
        .register_relationship_type(RelationshipType::new(TAGGED));
    registry
}

/// Mesh bases on one simulated network.
pub struct TestMesh {
    pub network: Arc<SimNetwork>,
    pub bases: Vec<NetMeshBase>,
}

impl TestMesh {
    /// One mesh base per host name, e.g. `["alpha", "beta"]` becomes
    /// `sim://alpha` and `sim://beta`. Must be called inside a runtime.
    pub fn new(hosts: &[&str]) -> Self {
        Self::with_network(Arc::new(SimNetwork::new()), hosts)
    }

    pub fn with_network(network: Arc<SimNetwork>, hosts: &[&str]) -> Self {
        let bases = hosts
            .iter()
            .map(|host| {
                NetMeshBase::builder(net(&format!("sim://{}", host)), network.clone())
                    .registry(library_registry())
                    .config(fast_config())
                    .build()
                    .unwrap()
            })
            .collect();
        Self { network, bases }
    }

    pub fn base(&self, index: usize) -> &NetMeshBase {
        &self.bases[index]
    }

    /// Number of bases whose replica of `identifier` holds the lock.
    pub fn lock_holders(&self, identifier: &MeshObjectIdentifier) -> usize {
        self.bases
            .iter()
            .filter(|base| base.find_object(identifier).map(|o| o.has_lock()).unwrap_or(false))
            .count()
    }

    /// Number of bases whose replica of `identifier` is the home replica.
    pub fn home_replicas(&self, identifier: &MeshObjectIdentifier) -> usize {
        self.bases
            .iter()
            .filter(|base| {
                base.find_object(identifier)
                    .map(|o| o.is_home_replica())
                    .unwrap_or(false)
            })
            .count()
    }
}

/// A mesh base whose access decisions follow `rules`.
pub fn guarded_base(
    network: &Arc<SimNetwork>,
    host: &str,
    rules: Arc<RuleBasedAccessManager>,
) -> NetMeshBase {
    NetMeshBase::builder(net(&format!("sim://{}", host)), network.clone())
        .registry(library_registry())
        .config(fast_config())
        .security(rules)
        .build()
        .unwrap()
}

/// The value of a property on the local replica, if there is one.
pub fn property_of(
    base: &NetMeshBase,
    identifier: &MeshObjectIdentifier,
    property: &str,
) -> Option<PropertyValue> {
    base.find_object(identifier)
        .ok()
        .and_then(|object| object.property(property).cloned())
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! NetMesh: Replicated Mesh Object Graph
//!
//! Mesh objects live on mesh bases that replicate them to each other. Every
//! object has exactly one home replica and one lock holder at any time; the
//! lock moves between replicas on demand, and changes made where the lock is
//! travel along the replication tree to every other replica.

pub mod access;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod differencer;
pub mod error;
pub mod identifier;
pub mod lock;
pub mod logging;
pub mod mesh;
pub mod meshbase;
pub mod model;
pub mod probe;
pub mod proxy;
pub mod security;
pub mod storage;
pub mod transport;
pub mod xpriso;

pub use access::AccessSpecification;
pub use error::{ConsistencyWarning, LockFailure, MeshError, StorageError};
pub use identifier::{IdentifierFactory, MeshObjectIdentifier, NetworkIdentifier};
pub use lock::{LockEpoch, PushOutcome};
pub use mesh::{Change, ChangeSet, MeshObject, MeshObjectSnapshot, Transaction};
pub use meshbase::{CommitReport, MaintenanceReport, NetMeshBase, NetMeshBaseBuilder};
pub use model::{PropertyValue, TypeRegistry};

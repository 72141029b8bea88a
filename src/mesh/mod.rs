//! Mesh Object store
//!
//! Local state of mesh objects (home replicas and replicas of objects homed
//! elsewhere), change events, and the transactions that produce them.

pub mod change;
pub mod object;
pub mod store;
pub mod transaction;

pub use change::{Change, ChangeKind, ChangeSet, SnapshotSet};
pub use object::{MeshObject, MeshObjectSnapshot, ReplicaInfo, Tombstone};
pub use store::MeshObjectStore;
pub use transaction::{Transaction, TransactionToken};

//! Lock epochs and lock protocol outcomes.
//!
//! Every transfer of a lock (grant, push, reclaim) issues a new epoch. A replica
//! only ever accepts a transfer whose epoch is newer than the one it already
//! knows, which makes replayed and stale transfers harmless.
//!
//! Reclaims start a new generation. Only the home replica reclaims, and every
//! epoch downstream derives from one the home issued, so a reclaim outranks any
//! grant or push still travelling through the replica tree.

use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::mesh::MeshObjectSnapshot;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monotonic lock generation of one mesh object.
///
/// Ordered by generation, then counter. Two transfers issued concurrently with
/// the same generation and counter are ordered by their origin: the lower
/// network identifier wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockEpoch {
    pub generation: u64,
    pub counter: u64,
    pub origin: NetworkIdentifier,
}

impl LockEpoch {
    /// The epoch of a freshly created object.
    pub fn initial(origin: &NetworkIdentifier) -> Self {
        Self {
            generation: 0,
            counter: 0,
            origin: origin.clone(),
        }
    }

    /// The epoch issued by `origin` for the next transfer.
    pub fn next(&self, origin: &NetworkIdentifier) -> Self {
        Self {
            generation: self.generation,
            counter: self.counter + 1,
            origin: origin.clone(),
        }
    }

    /// The epoch issued by the home replica `origin` when it reclaims the lock.
    pub fn reclaimed(&self, origin: &NetworkIdentifier) -> Self {
        Self {
            generation: self.generation + 1,
            counter: 0,
            origin: origin.clone(),
        }
    }

    pub fn is_newer_than(&self, other: &LockEpoch) -> bool {
        self > other
    }
}

impl Ord for LockEpoch {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| other.origin.cmp(&self.origin))
    }
}

impl PartialOrd for LockEpoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LockEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.generation, self.counter, self.origin)
    }
}

/// A lock handed from one replica to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockTransfer {
    pub identifier: MeshObjectIdentifier,
    pub epoch: LockEpoch,
    /// State of the object at the sender when the lock left it.
    pub snapshot: Option<MeshObjectSnapshot>,
}

/// A refused lock request, carrying the refuser's current epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRefusal {
    pub identifier: MeshObjectIdentifier,
    pub epoch: LockEpoch,
}

/// Answer to a lock request.
#[derive(Debug, Clone, PartialEq)]
pub enum LockReply {
    Granted(LockEpoch),
    Denied(Option<LockEpoch>),
}

/// Answer to a lock push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Ack,
    Nack,
}

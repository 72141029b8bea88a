//! Xpriso message shape.

use crate::access::AccessSpecification;
use crate::error::MeshError;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use crate::lock::{LockEpoch, LockRefusal, LockTransfer};
use crate::mesh::{Change, ChangeKind, ChangeSet, MeshObjectSnapshot};
use serde::{Deserialize, Serialize};

/// A full object handed to a peer, with the lock epoch the sender knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyedObject {
    pub snapshot: MeshObjectSnapshot,
    pub epoch: LockEpoch,
}

/// One protocol exchange between two proxies.
///
/// `session` and `sequence` are stamped by the sending proxy: sequence numbers
/// start at 1 for each session and let the receiver restore send order. All
/// object changes travel in `changes`, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XprisoMessage {
    pub request_id: u64,
    pub response_id: Option<u64>,
    pub session: u64,
    pub sequence: u64,
    pub sender: NetworkIdentifier,
    pub receiver: NetworkIdentifier,
    pub expects_response: bool,

    pub conveyed_objects: Vec<ConveyedObject>,
    pub requested_first_time_objects: Vec<AccessSpecification>,
    pub requested_canceled_objects: Vec<MeshObjectIdentifier>,
    pub requested_resynchronize_replicas: Vec<MeshObjectIdentifier>,
    /// Objects the responder's access manager would not hand out.
    pub refused_objects: Vec<MeshObjectIdentifier>,

    pub requested_lock_objects: Vec<MeshObjectIdentifier>,
    pub push_lock_objects: Vec<LockTransfer>,
    pub accepted_lock_objects: Vec<MeshObjectIdentifier>,
    pub denied_lock_objects: Vec<LockRefusal>,
    pub reclaimed_lock_objects: Vec<LockTransfer>,

    pub requested_home_replicas: Vec<MeshObjectIdentifier>,
    pub push_home_replicas: Vec<LockTransfer>,

    pub withdrawn_requests: Vec<u64>,
    pub changes: ChangeSet,
    pub cease_communications: bool,
}

impl XprisoMessage {
    pub fn new(sender: NetworkIdentifier, receiver: NetworkIdentifier) -> Self {
        Self {
            request_id: 0,
            response_id: None,
            session: 0,
            sequence: 0,
            sender,
            receiver,
            expects_response: false,
            conveyed_objects: Vec::new(),
            requested_first_time_objects: Vec::new(),
            requested_canceled_objects: Vec::new(),
            requested_resynchronize_replicas: Vec::new(),
            refused_objects: Vec::new(),
            requested_lock_objects: Vec::new(),
            push_lock_objects: Vec::new(),
            accepted_lock_objects: Vec::new(),
            denied_lock_objects: Vec::new(),
            reclaimed_lock_objects: Vec::new(),
            requested_home_replicas: Vec::new(),
            push_home_replicas: Vec::new(),
            withdrawn_requests: Vec::new(),
            changes: ChangeSet::new(),
            cease_communications: false,
        }
    }

    /// An empty reply to this message.
    pub fn response_to(&self) -> Self {
        let mut response = Self::new(self.receiver.clone(), self.sender.clone());
        response.response_id = Some(self.request_id);
        response
    }

    pub fn is_response(&self) -> bool {
        self.response_id.is_some()
    }

    /// Whether the message carries anything besides its header.
    pub fn is_empty(&self) -> bool {
        self.conveyed_objects.is_empty()
            && self.requested_first_time_objects.is_empty()
            && self.requested_canceled_objects.is_empty()
            && self.requested_resynchronize_replicas.is_empty()
            && self.refused_objects.is_empty()
            && self.requested_lock_objects.is_empty()
            && self.push_lock_objects.is_empty()
            && self.accepted_lock_objects.is_empty()
            && self.denied_lock_objects.is_empty()
            && self.reclaimed_lock_objects.is_empty()
            && self.requested_home_replicas.is_empty()
            && self.push_home_replicas.is_empty()
            && self.withdrawn_requests.is_empty()
            && self.changes.is_empty()
            && !self.cease_communications
    }

    /// Sanity checks on a received message.
    pub fn check(&self) -> Result<(), MeshError> {
        if self.sender == self.receiver {
            return Err(MeshError::Protocol(format!(
                "message {} sent to itself by {}",
                self.request_id, self.sender
            )));
        }
        if self.request_id == 0 {
            return Err(MeshError::Protocol("missing request id".to_string()));
        }
        if self.sequence == 0 {
            return Err(MeshError::Protocol(format!(
                "message {} has no sequence number",
                self.request_id
            )));
        }
        if self.response_id == Some(0) {
            return Err(MeshError::Protocol(format!(
                "message {} responds to request 0",
                self.request_id
            )));
        }
        Ok(())
    }

    pub fn property_changes(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::PropertyChanged)
    }

    pub fn neighbor_additions(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::NeighborAdded)
    }

    pub fn neighbor_removals(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::NeighborRemoved)
    }

    pub fn type_additions(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::TypesAdded)
    }

    pub fn type_removals(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::TypesRemoved)
    }

    pub fn role_additions(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::RolesAdded)
    }

    pub fn role_removals(&self) -> impl Iterator<Item = &Change> {
        self.changes.of_kind(ChangeKind::RolesRemoved)
    }

    pub fn deletions(&self) -> impl Iterator<Item = &MeshObjectIdentifier> {
        self.changes
            .of_kind(ChangeKind::Deleted)
            .map(|c| c.identifier())
    }
}

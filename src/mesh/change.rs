//! Change events
//!
//! A `Change` describes one modification of one mesh object. Changes are
//! one-sided: relating A to B is two changes, one on A and one on B. A
//! `ChangeSet` keeps changes in the order they happened; consumers must apply
//! them in that order.

use crate::identifier::MeshObjectIdentifier;
use crate::mesh::object::MeshObjectSnapshot;
use crate::model::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Snapshots of a set of mesh objects, keyed by identifier.
pub type SnapshotSet = BTreeMap<MeshObjectIdentifier, MeshObjectSnapshot>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Created {
        identifier: MeshObjectIdentifier,
        types: BTreeSet<String>,
    },
    Deleted {
        identifier: MeshObjectIdentifier,
    },
    TypesAdded {
        identifier: MeshObjectIdentifier,
        types: BTreeSet<String>,
    },
    TypesRemoved {
        identifier: MeshObjectIdentifier,
        types: BTreeSet<String>,
    },
    PropertyChanged {
        identifier: MeshObjectIdentifier,
        property: String,
        old: Option<PropertyValue>,
        new: Option<PropertyValue>,
    },
    NeighborAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: BTreeSet<String>,
    },
    NeighborRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    RolesAdded {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: BTreeSet<String>,
    },
    RolesRemoved {
        identifier: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: BTreeSet<String>,
    },
}

/// Discriminant of a `Change`, for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Deleted,
    TypesAdded,
    TypesRemoved,
    PropertyChanged,
    NeighborAdded,
    NeighborRemoved,
    RolesAdded,
    RolesRemoved,
}

impl Change {
    /// The object this change modifies.
    pub fn identifier(&self) -> &MeshObjectIdentifier {
        match self {
            Change::Created { identifier, .. }
            | Change::Deleted { identifier }
            | Change::TypesAdded { identifier, .. }
            | Change::TypesRemoved { identifier, .. }
            | Change::PropertyChanged { identifier, .. }
            | Change::NeighborAdded { identifier, .. }
            | Change::NeighborRemoved { identifier, .. }
            | Change::RolesAdded { identifier, .. }
            | Change::RolesRemoved { identifier, .. } => identifier,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Created { .. } => ChangeKind::Created,
            Change::Deleted { .. } => ChangeKind::Deleted,
            Change::TypesAdded { .. } => ChangeKind::TypesAdded,
            Change::TypesRemoved { .. } => ChangeKind::TypesRemoved,
            Change::PropertyChanged { .. } => ChangeKind::PropertyChanged,
            Change::NeighborAdded { .. } => ChangeKind::NeighborAdded,
            Change::NeighborRemoved { .. } => ChangeKind::NeighborRemoved,
            Change::RolesAdded { .. } => ChangeKind::RolesAdded,
            Change::RolesRemoved { .. } => ChangeKind::RolesRemoved,
        }
    }

    /// Apply to the snapshot of the object this change modifies.
    ///
    /// Lifecycle changes (`Created`, `Deleted`) are handled by the owner of the
    /// snapshot and are no-ops here. Returns whether the snapshot changed, so
    /// applying the same change twice reports `false` the second time.
    pub fn apply_to(&self, snapshot: &mut MeshObjectSnapshot) -> bool {
        match self {
            Change::Created { .. } | Change::Deleted { .. } => false,
            Change::TypesAdded { types, .. } => {
                let before = snapshot.types.len();
                snapshot.types.extend(types.iter().cloned());
                snapshot.types.len() != before
            }
            Change::TypesRemoved { types, .. } => {
                let before = snapshot.types.len();
                snapshot.types.retain(|t| !types.contains(t));
                snapshot.types.len() != before
            }
            Change::PropertyChanged { property, new, .. } => {
                let previous = match new {
                    Some(value) => snapshot.properties.insert(property.clone(), value.clone()),
                    None => snapshot.properties.remove(property),
                };
                previous.as_ref() != new.as_ref()
            }
            Change::NeighborAdded {
                neighbor, roles, ..
            } => {
                if snapshot.neighbors.contains_key(neighbor) {
                    false
                } else {
                    snapshot.neighbors.insert(neighbor.clone(), roles.clone());
                    true
                }
            }
            Change::NeighborRemoved { neighbor, .. } => {
                snapshot.neighbors.remove(neighbor).is_some()
            }
            Change::RolesAdded {
                neighbor, roles, ..
            } => match snapshot.neighbors.get_mut(neighbor) {
                Some(existing) => {
                    let before = existing.len();
                    existing.extend(roles.iter().cloned());
                    existing.len() != before
                }
                None => false,
            },
            Change::RolesRemoved {
                neighbor, roles, ..
            } => match snapshot.neighbors.get_mut(neighbor) {
                Some(existing) => {
                    let before = existing.len();
                    existing.retain(|r| !roles.contains(r));
                    existing.len() != before
                }
                None => false,
            },
        }
    }
}

/// Ordered list of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn of_kind(&self, kind: ChangeKind) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(move |c| c.kind() == kind)
    }

    /// Changes to one object, in order.
    pub fn for_object<'a>(
        &'a self,
        identifier: &'a MeshObjectIdentifier,
    ) -> impl Iterator<Item = &'a Change> {
        self.changes
            .iter()
            .filter(move |c| c.identifier() == identifier)
    }

    /// Every object modified by this change set.
    pub fn affected_identifiers(&self) -> BTreeSet<MeshObjectIdentifier> {
        self.changes.iter().map(|c| c.identifier().clone()).collect()
    }

    /// Apply every change, in order, to a set of snapshots.
    pub fn apply_to(&self, snapshots: &mut SnapshotSet) {
        for change in &self.changes {
            match change {
                Change::Created { identifier, types } => {
                    let mut snapshot = MeshObjectSnapshot::new(identifier.clone());
                    snapshot.types = types.clone();
                    snapshots.insert(identifier.clone(), snapshot);
                }
                Change::Deleted { identifier } => {
                    snapshots.remove(identifier);
                }
                other => {
                    if let Some(snapshot) = snapshots.get_mut(other.identifier()) {
                        other.apply_to(snapshot);
                    }
                }
            }
        }
    }

    pub fn into_vec(self) -> Vec<Change> {
        self.changes
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        Self { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

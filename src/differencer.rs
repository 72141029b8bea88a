//! Differencer
//!
//! Computes the ordered changes that turn one snapshot (or set of snapshots)
//! into another. Applying the result to the older side in order reproduces the
//! newer side exactly.

use crate::mesh::{Change, ChangeSet, MeshObjectSnapshot, SnapshotSet};
use std::collections::BTreeSet;

/// Changes turning `old` into `new` for a single object.
///
/// `None` on either side means the object does not exist there, which yields a
/// creation (followed by its properties and neighbors) or a deletion.
pub fn diff_object(old: Option<&MeshObjectSnapshot>, new: Option<&MeshObjectSnapshot>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    match (old, new) {
        (None, None) => {}
        (Some(old), None) => changes.push(Change::Deleted {
            identifier: old.identifier.clone(),
        }),
        (None, Some(new)) => {
            changes.push(Change::Created {
                identifier: new.identifier.clone(),
                types: new.types.clone(),
            });
            for (property, value) in &new.properties {
                changes.push(Change::PropertyChanged {
                    identifier: new.identifier.clone(),
                    property: property.clone(),
                    old: None,
                    new: Some(value.clone()),
                });
            }
            for (neighbor, roles) in &new.neighbors {
                changes.push(Change::NeighborAdded {
                    identifier: new.identifier.clone(),
                    neighbor: neighbor.clone(),
                    roles: roles.clone(),
                });
            }
        }
        (Some(old), Some(new)) => diff_existing(old, new, &mut changes),
    }
    changes
}

fn diff_existing(old: &MeshObjectSnapshot, new: &MeshObjectSnapshot, changes: &mut ChangeSet) {
    let identifier = &new.identifier;

    let added_types: BTreeSet<String> = new.types.difference(&old.types).cloned().collect();
    if !added_types.is_empty() {
        changes.push(Change::TypesAdded {
            identifier: identifier.clone(),
            types: added_types,
        });
    }

    let property_names: BTreeSet<&String> =
        old.properties.keys().chain(new.properties.keys()).collect();
    for property in property_names {
        let before = old.properties.get(property);
        let after = new.properties.get(property);
        if before != after {
            changes.push(Change::PropertyChanged {
                identifier: identifier.clone(),
                property: property.clone(),
                old: before.cloned(),
                new: after.cloned(),
            });
        }
    }

    let removed_types: BTreeSet<String> = old.types.difference(&new.types).cloned().collect();
    if !removed_types.is_empty() {
        changes.push(Change::TypesRemoved {
            identifier: identifier.clone(),
            types: removed_types,
        });
    }

    for neighbor in old.neighbors.keys() {
        if !new.neighbors.contains_key(neighbor) {
            changes.push(Change::NeighborRemoved {
                identifier: identifier.clone(),
                neighbor: neighbor.clone(),
            });
        }
    }
    for (neighbor, roles) in &new.neighbors {
        match old.neighbors.get(neighbor) {
            None => changes.push(Change::NeighborAdded {
                identifier: identifier.clone(),
                neighbor: neighbor.clone(),
                roles: roles.clone(),
            }),
            Some(old_roles) => {
                let removed: BTreeSet<String> = old_roles.difference(roles).cloned().collect();
                if !removed.is_empty() {
                    changes.push(Change::RolesRemoved {
                        identifier: identifier.clone(),
                        neighbor: neighbor.clone(),
                        roles: removed,
                    });
                }
                let added: BTreeSet<String> = roles.difference(old_roles).cloned().collect();
                if !added.is_empty() {
                    changes.push(Change::RolesAdded {
                        identifier: identifier.clone(),
                        neighbor: neighbor.clone(),
                        roles: added,
                    });
                }
            }
        }
    }
}

/// Changes turning `baseline` into `comparison`.
///
/// Objects are visited in identifier order; deletions come last so that
/// neighbor removals referring to deleted objects precede the deletions.
pub fn diff(baseline: &SnapshotSet, comparison: &SnapshotSet) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (identifier, new) in comparison {
        changes.extend(diff_object(baseline.get(identifier), Some(new)));
    }
    for (identifier, old) in baseline {
        if !comparison.contains_key(identifier) {
            changes.extend(diff_object(Some(old), None));
        }
    }
    changes
}

/// Apply `changes` in order to `snapshots`.
pub fn apply(snapshots: &mut SnapshotSet, changes: &ChangeSet) {
    changes.apply_to(snapshots);
}

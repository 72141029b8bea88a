//! Transactions
//!
//! A `Transaction` owns the single-writer gate of its mesh base for as long as
//! it lives. Mutations are staged against copies of the touched objects and
//! recorded as an ordered change set; the first touch of an object checks
//! access and obtains its lock, which may involve a round trip to another
//! mesh base. `commit` applies the whole change set or nothing.

use crate::error::MeshError;
use crate::identifier::MeshObjectIdentifier;
use crate::meshbase::{CommitReport, NetMeshBase, WriteGate};
use crate::mesh::change::{Change, ChangeSet};
use crate::mesh::object::MeshObjectSnapshot;
use crate::model::PropertyValue;
use crate::security::Operation;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Proof that the holder is inside a transaction.
#[derive(Debug)]
pub struct TransactionToken {
    _private: (),
}

impl TransactionToken {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }
}

#[derive(Debug)]
struct Staged {
    snapshot: MeshObjectSnapshot,
    created: bool,
    deleted: bool,
}

/// An open transaction on a mesh base.
pub struct Transaction {
    base: NetMeshBase,
    token: TransactionToken,
    staged: BTreeMap<MeshObjectIdentifier, Staged>,
    changes: ChangeSet,
    gate: WriteGate,
}

impl Transaction {
    pub(crate) fn new(base: NetMeshBase, gate: WriteGate) -> Self {
        Self {
            base,
            token: TransactionToken::new(),
            staged: BTreeMap::new(),
            changes: ChangeSet::new(),
            gate,
        }
    }

    /// Changes recorded so far.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// The staged state of an object touched by this transaction.
    pub fn get(&self, identifier: &MeshObjectIdentifier) -> Option<&MeshObjectSnapshot> {
        self.staged
            .get(identifier)
            .filter(|s| !s.deleted)
            .map(|s| &s.snapshot)
    }

    async fn writable(&mut self, identifier: &MeshObjectIdentifier) -> Result<&mut Staged, MeshError> {
        if !self.staged.contains_key(identifier) {
            let snapshot = self.base.prepare_for_write(identifier).await?;
            self.staged.insert(
                identifier.clone(),
                Staged {
                    snapshot,
                    created: false,
                    deleted: false,
                },
            );
        }
        match self.staged.get_mut(identifier) {
            Some(staged) if !staged.deleted => Ok(staged),
            _ => Err(MeshError::NotFound(identifier.clone())),
        }
    }

    /// Create a new object homed here. A fresh identifier is generated when
    /// none is given.
    pub async fn create_object(
        &mut self,
        identifier: Option<MeshObjectIdentifier>,
        types: &[&str],
    ) -> Result<MeshObjectIdentifier, MeshError> {
        let registry = self.base.registry().clone();
        for type_name in types {
            registry.require_entity_type(type_name)?;
        }

        let identifier = identifier.unwrap_or_else(|| self.base.create_identifier());
        self.base.check_local_access(&identifier, Operation::Write)?;
        if self.staged.contains_key(&identifier) || self.base.contains(&identifier) {
            return Err(MeshError::IdentifierInUse(identifier));
        }

        let type_set: BTreeSet<String> = types.iter().map(|t| t.to_string()).collect();
        let mut snapshot = MeshObjectSnapshot::new(identifier.clone());
        snapshot.types = type_set.clone();
        self.changes.push(Change::Created {
            identifier: identifier.clone(),
            types: type_set,
        });

        for type_name in types {
            let Some(entity_type) = registry.entity_type(type_name) else {
                continue;
            };
            for property in &entity_type.properties {
                if let Some(default) = &property.default {
                    if snapshot.properties.contains_key(&property.name) {
                        continue;
                    }
                    snapshot
                        .properties
                        .insert(property.name.clone(), default.clone());
                    self.changes.push(Change::PropertyChanged {
                        identifier: identifier.clone(),
                        property: property.name.clone(),
                        old: None,
                        new: Some(default.clone()),
                    });
                }
            }
        }

        self.staged.insert(
            identifier.clone(),
            Staged {
                snapshot,
                created: true,
                deleted: false,
            },
        );
        debug!(identifier = %identifier, "Staged object creation");
        Ok(identifier)
    }

    /// Bless an object with an entity type, applying the type's defaults.
    pub async fn bless(
        &mut self,
        identifier: &MeshObjectIdentifier,
        type_name: &str,
    ) -> Result<(), MeshError> {
        let registry = self.base.registry().clone();
        let entity_type = registry.require_entity_type(type_name)?;
        let staged = self.writable(identifier).await?;
        if staged.snapshot.is_blessed_by(type_name) {
            return Err(MeshError::AlreadyBlessed {
                identifier: identifier.clone(),
                type_name: type_name.to_string(),
            });
        }
        staged.snapshot.types.insert(type_name.to_string());

        let mut defaults = Vec::new();
        for property in &entity_type.properties {
            if let Some(default) = &property.default {
                if !staged.snapshot.properties.contains_key(&property.name) {
                    staged
                        .snapshot
                        .properties
                        .insert(property.name.clone(), default.clone());
                    defaults.push((property.name.clone(), default.clone()));
                }
            }
        }

        self.changes.push(Change::TypesAdded {
            identifier: identifier.clone(),
            types: [type_name.to_string()].into_iter().collect(),
        });
        for (property, value) in defaults {
            self.changes.push(Change::PropertyChanged {
                identifier: identifier.clone(),
                property,
                old: None,
                new: Some(value),
            });
        }
        Ok(())
    }

    /// Remove an entity type; properties no remaining type declares are dropped.
    pub async fn unbless(
        &mut self,
        identifier: &MeshObjectIdentifier,
        type_name: &str,
    ) -> Result<(), MeshError> {
        let registry = self.base.registry().clone();
        let staged = self.writable(identifier).await?;
        if !staged.snapshot.types.remove(type_name) {
            return Err(MeshError::NotBlessed {
                identifier: identifier.clone(),
                type_name: type_name.to_string(),
            });
        }

        let orphaned: Vec<String> = staged
            .snapshot
            .properties
            .keys()
            .filter(|name| !registry.declares_property(&staged.snapshot.types, name))
            .cloned()
            .collect();
        let mut removed = Vec::new();
        for name in orphaned {
            if let Some(old) = staged.snapshot.properties.remove(&name) {
                removed.push((name, old));
            }
        }

        for (property, old) in removed {
            self.changes.push(Change::PropertyChanged {
                identifier: identifier.clone(),
                property,
                old: Some(old),
                new: None,
            });
        }
        self.changes.push(Change::TypesRemoved {
            identifier: identifier.clone(),
            types: [type_name.to_string()].into_iter().collect(),
        });
        Ok(())
    }

    /// Set a property declared by one of the object's types.
    pub async fn set_property(
        &mut self,
        identifier: &MeshObjectIdentifier,
        property: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(), MeshError> {
        self.write_property(identifier, property, Some(value.into()))
            .await
    }

    pub async fn remove_property(
        &mut self,
        identifier: &MeshObjectIdentifier,
        property: &str,
    ) -> Result<(), MeshError> {
        self.write_property(identifier, property, None).await
    }

    async fn write_property(
        &mut self,
        identifier: &MeshObjectIdentifier,
        property: &str,
        new: Option<PropertyValue>,
    ) -> Result<(), MeshError> {
        let registry = self.base.registry().clone();
        let staged = self.writable(identifier).await?;
        if !registry.declares_property(&staged.snapshot.types, property) {
            return Err(MeshError::IllegalProperty {
                identifier: identifier.clone(),
                property: property.to_string(),
            });
        }

        let old = match &new {
            Some(value) => staged
                .snapshot
                .properties
                .insert(property.to_string(), value.clone()),
            None => staged.snapshot.properties.remove(property),
        };
        if old == new {
            return Ok(());
        }
        self.changes.push(Change::PropertyChanged {
            identifier: identifier.clone(),
            property: property.to_string(),
            old,
            new,
        });
        Ok(())
    }

    /// Relate two objects without roles.
    pub async fn relate(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), MeshError> {
        self.add_neighbors(a, b, BTreeSet::new(), BTreeSet::new())
            .await
    }

    /// Remove the relationship between two objects, with all its roles.
    pub async fn unrelate(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
    ) -> Result<(), MeshError> {
        let related = self.writable(a).await?.snapshot.is_related_to(b);
        if !related {
            return Err(MeshError::NotRelated(a.clone(), b.clone()));
        }
        self.writable(b).await?;

        for (from, to) in [(a, b), (b, a)] {
            if let Some(staged) = self.staged.get_mut(from) {
                if staged.snapshot.neighbors.remove(to).is_some() {
                    self.changes.push(Change::NeighborRemoved {
                        identifier: from.clone(),
                        neighbor: to.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Bless the relationship from `source` to `destination` with a
    /// relationship type, relating the two objects first if needed.
    pub async fn bless_relationship(
        &mut self,
        source: &MeshObjectIdentifier,
        destination: &MeshObjectIdentifier,
        relationship: &str,
    ) -> Result<(), MeshError> {
        let relationship_type = self
            .base
            .registry()
            .require_relationship_type(relationship)?
            .clone();
        let source_role = relationship_type.source_role();
        let destination_role = relationship_type.destination_role();

        let already_related = self.writable(source).await?.snapshot.is_related_to(destination);
        if !already_related {
            return self
                .add_neighbors(
                    source,
                    destination,
                    [source_role].into_iter().collect(),
                    [destination_role].into_iter().collect(),
                )
                .await;
        }

        self.writable(destination).await?;
        for (from, to, role) in [
            (source, destination, &source_role),
            (destination, source, &destination_role),
        ] {
            let blessed = self
                .get(from)
                .and_then(|s| s.roles_towards(to))
                .map(|roles| roles.contains(role))
                .unwrap_or(false);
            if blessed {
                return Err(MeshError::AlreadyBlessed {
                    identifier: from.clone(),
                    type_name: role.clone(),
                });
            }
        }
        for (from, to, role) in [
            (source, destination, source_role),
            (destination, source, destination_role),
        ] {
            if let Some(staged) = self.staged.get_mut(from) {
                staged
                    .snapshot
                    .neighbors
                    .entry(to.clone())
                    .or_default()
                    .insert(role.clone());
            }
            self.changes.push(Change::RolesAdded {
                identifier: from.clone(),
                neighbor: to.clone(),
                roles: [role].into_iter().collect(),
            });
        }
        Ok(())
    }

    /// Remove a relationship type from the relationship between two objects.
    pub async fn unbless_relationship(
        &mut self,
        source: &MeshObjectIdentifier,
        destination: &MeshObjectIdentifier,
        relationship: &str,
    ) -> Result<(), MeshError> {
        let relationship_type = self
            .base
            .registry()
            .require_relationship_type(relationship)?
            .clone();
        let source_role = relationship_type.source_role();
        let destination_role = relationship_type.destination_role();

        let roles = self
            .writable(source)
            .await?
            .snapshot
            .roles_towards(destination)
            .cloned()
            .ok_or_else(|| MeshError::NotRelated(source.clone(), destination.clone()))?;
        if !roles.contains(&source_role) {
            return Err(MeshError::NotBlessed {
                identifier: source.clone(),
                type_name: source_role,
            });
        }
        self.writable(destination).await?;

        for (from, to, role) in [
            (source, destination, source_role),
            (destination, source, destination_role),
        ] {
            let removed = self
                .staged
                .get_mut(from)
                .and_then(|s| s.snapshot.neighbors.get_mut(to))
                .map(|roles| roles.remove(&role))
                .unwrap_or(false);
            if removed {
                self.changes.push(Change::RolesRemoved {
                    identifier: from.clone(),
                    neighbor: to.clone(),
                    roles: [role].into_iter().collect(),
                });
            }
        }
        Ok(())
    }

    async fn add_neighbors(
        &mut self,
        a: &MeshObjectIdentifier,
        b: &MeshObjectIdentifier,
        roles_of_a: BTreeSet<String>,
        roles_of_b: BTreeSet<String>,
    ) -> Result<(), MeshError> {
        if self.writable(a).await?.snapshot.is_related_to(b) {
            return Err(MeshError::AlreadyRelated(a.clone(), b.clone()));
        }
        self.writable(b).await?;

        for (from, to, roles) in [(a, b, roles_of_a), (b, a, roles_of_b)] {
            if let Some(staged) = self.staged.get_mut(from) {
                staged.snapshot.neighbors.insert(to.clone(), roles.clone());
            }
            self.changes.push(Change::NeighborAdded {
                identifier: from.clone(),
                neighbor: to.clone(),
                roles,
            });
        }
        Ok(())
    }

    /// Delete an object. Locally known neighbors lose their reference to it,
    /// which requires their locks as well.
    pub async fn delete(&mut self, identifier: &MeshObjectIdentifier) -> Result<(), MeshError> {
        self.base.check_local_access(identifier, Operation::Delete)?;
        let neighbors: Vec<MeshObjectIdentifier> = self
            .writable(identifier)
            .await?
            .snapshot
            .neighbors
            .keys()
            .cloned()
            .collect();

        for neighbor in neighbors {
            if &neighbor == identifier {
                continue;
            }
            if !self.staged.contains_key(&neighbor) && !self.base.contains(&neighbor) {
                continue;
            }
            let staged = self.writable(&neighbor).await?;
            if staged.snapshot.neighbors.remove(identifier).is_some() {
                self.changes.push(Change::NeighborRemoved {
                    identifier: neighbor.clone(),
                    neighbor: identifier.clone(),
                });
            }
        }

        if let Some(staged) = self.staged.get_mut(identifier) {
            staged.deleted = true;
        }
        self.changes.push(Change::Deleted {
            identifier: identifier.clone(),
        });
        Ok(())
    }

    /// Apply the recorded changes, persist and propagate them.
    pub async fn commit(self) -> Result<CommitReport, MeshError> {
        let Transaction {
            base,
            token,
            staged,
            changes,
            gate,
        } = self;
        let created: BTreeSet<MeshObjectIdentifier> = staged
            .iter()
            .filter(|(_, s)| s.created)
            .map(|(id, _)| id.clone())
            .collect();
        base.commit_changes(&token, changes, &created, gate).await
    }

    /// Discard every staged change.
    pub fn rollback(self) {
        debug!(changes = self.changes.len(), "Transaction rolled back");
    }
}

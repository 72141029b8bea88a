//! Access control
//!
//! The identity/security collaborator decides whether a caller may perform an
//! operation on a mesh object. The mesh base consults it before honoring local
//! mutations and requests arriving from other mesh bases.

use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Obtain a replica.
    Read,
    /// Modify an object or apply a change received from another replica.
    Write,
    Delete,
    ObtainLock,
    ObtainHomeReplica,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::ObtainLock => "obtain the lock of",
            Operation::ObtainHomeReplica => "obtain the home replica of",
        };
        f.write_str(text)
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Permitted,
    Denied,
}

impl Permission {
    pub fn is_permitted(self) -> bool {
        self == Permission::Permitted
    }
}

/// Decides who may do what.
pub trait AccessManager: Send + Sync {
    fn check_permitted_access(
        &self,
        caller: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
        operation: Operation,
    ) -> Permission;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

impl AccessManager for PermitAll {
    fn check_permitted_access(
        &self,
        _caller: &NetworkIdentifier,
        _identifier: &MeshObjectIdentifier,
        _operation: Operation,
    ) -> Permission {
        Permission::Permitted
    }
}

/// A deny rule; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub caller: Option<NetworkIdentifier>,
    pub identifier: Option<MeshObjectIdentifier>,
    pub operation: Option<Operation>,
}

impl AccessRule {
    fn matches(
        &self,
        caller: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
        operation: Operation,
    ) -> bool {
        self.caller.as_ref().map_or(true, |c| c == caller)
            && self.identifier.as_ref().map_or(true, |i| i == identifier)
            && self.operation.map_or(true, |o| o == operation)
    }
}

/// Permits everything not matched by a deny rule.
#[derive(Debug, Default)]
pub struct RuleBasedAccessManager {
    deny: RwLock<Vec<AccessRule>>,
}

impl RuleBasedAccessManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, rule: AccessRule) {
        self.deny.write().push(rule);
    }

    pub fn clear(&self) {
        self.deny.write().clear();
    }
}

impl AccessManager for RuleBasedAccessManager {
    fn check_permitted_access(
        &self,
        caller: &NetworkIdentifier,
        identifier: &MeshObjectIdentifier,
        operation: Operation,
    ) -> Permission {
        let denied = self
            .deny
            .read()
            .iter()
            .any(|rule| rule.matches(caller, identifier, operation));
        if denied {
            tracing::debug!(
                caller = %caller,
                identifier = %identifier,
                operation = %operation,
                "Access denied by rule"
            );
            Permission::Denied
        } else {
            Permission::Permitted
        }
    }
}

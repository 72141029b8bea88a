//! Access specifications: "object X, reachable via network path P".

use crate::error::MeshError;
use crate::identifier::{MeshObjectIdentifier, NetworkIdentifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separates the hops of an access path in the external form.
pub const PATH_SEPARATOR: char = '!';

/// Describes how to reach a mesh object and whether its lock is wanted as well.
///
/// The path lists the mesh bases to go through, nearest first. An empty path
/// means "wherever the object's identifier says it lives".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessSpecification {
    path: Vec<NetworkIdentifier>,
    object: MeshObjectIdentifier,
    request_lock: bool,
}

impl AccessSpecification {
    pub fn new(path: Vec<NetworkIdentifier>, object: MeshObjectIdentifier) -> Self {
        Self {
            path,
            object,
            request_lock: false,
        }
    }

    /// Reach `object` directly at the mesh base that created it.
    pub fn direct(object: MeshObjectIdentifier) -> Self {
        Self::new(Vec::new(), object)
    }

    /// Also obtain the lock once the replica is local.
    pub fn with_lock(mut self) -> Self {
        self.request_lock = true;
        self
    }

    pub fn object(&self) -> &MeshObjectIdentifier {
        &self.object
    }

    pub fn path(&self) -> &[NetworkIdentifier] {
        &self.path
    }

    pub fn request_lock(&self) -> bool {
        self.request_lock
    }

    /// The path to follow, defaulting to the object's own mesh base.
    pub fn effective_path(&self) -> Vec<NetworkIdentifier> {
        if self.path.is_empty() {
            vec![self.object.network().clone()]
        } else {
            self.path.clone()
        }
    }

    pub fn first_hop(&self) -> Option<&NetworkIdentifier> {
        self.path.first().or_else(|| Some(self.object.network()))
    }

    /// The specification as seen by the first hop.
    pub fn remainder(&self) -> AccessSpecification {
        let path = if self.path.len() > 1 {
            self.path[1..].to_vec()
        } else {
            Vec::new()
        };
        AccessSpecification {
            path,
            object: self.object.clone(),
            request_lock: self.request_lock,
        }
    }

    /// Drop leading hops that name `local`.
    pub fn relative_to(&self, local: &NetworkIdentifier) -> AccessSpecification {
        let skip = self.path.iter().take_while(|hop| *hop == local).count();
        AccessSpecification {
            path: self.path[skip..].to_vec(),
            object: self.object.clone(),
            request_lock: self.request_lock,
        }
    }

    /// Parse `hop!hop!object`; the object part is resolved against the last hop.
    pub fn parse(context: &NetworkIdentifier, raw: &str) -> Result<Self, MeshError> {
        let segments: Vec<&str> = raw.split(PATH_SEPARATOR).collect();
        let Some((object_part, hops)) = segments.split_last() else {
            return Err(MeshError::parse(raw, "empty access specification"));
        };

        let path = hops
            .iter()
            .map(|hop| NetworkIdentifier::parse(hop))
            .collect::<Result<Vec<_>, _>>()?;
        let object_context = path.last().unwrap_or(context);
        let object = MeshObjectIdentifier::parse(object_context, object_part)?;

        Ok(Self::new(path, object))
    }

    /// The textual form of the path and object.
    ///
    /// `request_lock` is local to the caller and not part of this form; it
    /// travels in the serialized specification instead.
    pub fn to_external_form(&self) -> String {
        if self.path.is_empty() || (self.path.len() == 1 && &self.path[0] == self.object.network())
        {
            return self.object.to_external_form();
        }
        let mut out = String::new();
        for hop in &self.path {
            out.push_str(hop.as_str());
            out.push(PATH_SEPARATOR);
        }
        out.push_str(&self.object.to_external_form());
        out
    }
}

impl fmt::Display for AccessSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

/// Describe fetching `object` by first going to `network`.
///
/// When the object does not live at `network`, that host is asked to fetch it
/// from the object's own mesh base in turn.
pub fn resolve(network: &NetworkIdentifier, object: &MeshObjectIdentifier) -> AccessSpecification {
    let mut path = vec![network.clone()];
    if object.network() != network {
        path.push(object.network().clone());
    }
    AccessSpecification::new(path, object.clone())
}

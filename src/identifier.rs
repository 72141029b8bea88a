//! Identifiers
//!
//! Canonical names for hosts (`NetworkIdentifier`) and for mesh objects
//! (`MeshObjectIdentifier`). A mesh object identifier is qualified by the network
//! identifier of the mesh base that created it; its external form is
//! `<network>#<local-id>`, and the home object of a mesh base is written as the
//! bare network identifier.

use crate::error::MeshError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Separates the network part from the local id in an external form.
pub const SEPARATOR: char = '#';

/// Minimum length of a non-empty local id.
pub const MINIMUM_LOCAL_ID_LENGTH: usize = 4;

const GENERATED_ID_LENGTH: usize = 16;

/// Names a host (mesh base) reachable over the network.
///
/// The form is `scheme://rest`, e.g. `http://a.example.org/` or `test://host-a`.
/// Ordering is lexicographic on the external form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkIdentifier(String);

impl NetworkIdentifier {
    /// Parse a network identifier from its external form.
    pub fn parse(raw: &str) -> Result<Self, MeshError> {
        let raw = raw.trim();
        let Some((scheme, rest)) = raw.split_once("://") else {
            return Err(MeshError::parse(raw, "network identifier needs a scheme"));
        };
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(MeshError::parse(raw, "invalid scheme"));
        }
        if rest.is_empty() {
            return Err(MeshError::parse(raw, "empty network location"));
        }
        if let Some(bad) = rest
            .chars()
            .find(|c| c.is_whitespace() || *c == SEPARATOR || *c == '!')
        {
            return Err(MeshError::parse(
                raw,
                format!("invalid character {:?} in network identifier", bad),
            ));
        }
        Ok(Self(format!("{}://{}", scheme.to_ascii_lowercase(), rest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_external_form(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for NetworkIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NetworkIdentifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NetworkIdentifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NetworkIdentifier> for String {
    fn from(value: NetworkIdentifier) -> Self {
        value.0
    }
}

/// Globally unique, replica-stable name of a mesh object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MeshObjectIdentifier {
    network: NetworkIdentifier,
    local_id: String,
}

impl MeshObjectIdentifier {
    /// Identifier for `local_id` within `network`.
    pub fn new(network: &NetworkIdentifier, local_id: &str) -> Result<Self, MeshError> {
        check_local_id(local_id)?;
        Ok(Self {
            network: network.clone(),
            local_id: local_id.to_string(),
        })
    }

    /// The home object of a mesh base.
    pub fn home_object(network: &NetworkIdentifier) -> Self {
        Self {
            network: network.clone(),
            local_id: String::new(),
        }
    }

    /// Parse an identifier, resolving relative forms against `context`.
    ///
    /// * `""` is the home object of `context`
    /// * `"#foo"` is `foo` within `context`
    /// * `"scheme://host#foo"` is fully qualified
    /// * `"scheme://host"` is the home object of that host
    /// * anything else is a local id within `context`
    pub fn parse(context: &NetworkIdentifier, raw: &str) -> Result<Self, MeshError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::home_object(context));
        }
        if let Some(index) = raw.find(SEPARATOR) {
            if index == 0 {
                return Self::new(context, &raw[1..]);
            }
            let network = NetworkIdentifier::parse(&raw[..index])?;
            return Self::new(&network, &raw[index + 1..]);
        }
        if raw.contains("://") {
            return Ok(Self::home_object(&NetworkIdentifier::parse(raw)?));
        }
        Self::new(context, raw)
    }

    /// Parse a fully qualified external form.
    pub fn parse_absolute(raw: &str) -> Result<Self, MeshError> {
        let raw = raw.trim();
        match raw.find(SEPARATOR) {
            Some(0) | None if !raw.contains("://") => Err(MeshError::parse(
                raw,
                "identifier is not qualified by a network identifier",
            )),
            Some(index) => {
                let network = NetworkIdentifier::parse(&raw[..index])?;
                Self::new(&network, &raw[index + 1..])
            }
            None => Ok(Self::home_object(&NetworkIdentifier::parse(raw)?)),
        }
    }

    /// The mesh base this identifier was created in.
    pub fn network(&self) -> &NetworkIdentifier {
        &self.network
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_home_object(&self) -> bool {
        self.local_id.is_empty()
    }

    pub fn to_external_form(&self) -> String {
        if self.local_id.is_empty() {
            self.network.to_external_form()
        } else {
            format!("{}{}{}", self.network, SEPARATOR, self.local_id)
        }
    }

    /// External form relative to `context`: the bare local id when it lives there.
    pub fn to_local_form(&self, context: &NetworkIdentifier) -> String {
        if &self.network == context && !self.local_id.is_empty() {
            self.local_id.clone()
        } else {
            self.to_external_form()
        }
    }
}

fn check_local_id(local_id: &str) -> Result<(), MeshError> {
    if local_id.is_empty() {
        return Ok(());
    }
    if let Some(bad) = local_id
        .chars()
        .find(|c| matches!(*c, '.' | SEPARATOR | '!') || c.is_whitespace())
    {
        return Err(MeshError::parse(
            local_id,
            format!("local id must not contain {:?}", bad),
        ));
    }
    if local_id.chars().count() < MINIMUM_LOCAL_ID_LENGTH {
        return Err(MeshError::parse(
            local_id,
            format!(
                "local id must be at least {} characters long",
                MINIMUM_LOCAL_ID_LENGTH
            ),
        ));
    }
    Ok(())
}

impl fmt::Display for MeshObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_external_form())
    }
}

impl FromStr for MeshObjectIdentifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_absolute(s)
    }
}

impl TryFrom<String> for MeshObjectIdentifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse_absolute(&value)
    }
}

impl From<MeshObjectIdentifier> for String {
    fn from(value: MeshObjectIdentifier) -> Self {
        value.to_external_form()
    }
}

/// Generates fresh local ids for one mesh base.
#[derive(Debug)]
pub struct IdentifierFactory {
    network: NetworkIdentifier,
    counter: AtomicU64,
}

impl IdentifierFactory {
    pub fn new(network: NetworkIdentifier) -> Self {
        Self {
            network,
            counter: AtomicU64::new(0),
        }
    }

    /// A fresh identifier within this factory's mesh base.
    pub fn create_identifier(&self) -> MeshObjectIdentifier {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut hasher = blake3::Hasher::new();
        hasher.update(self.network.as_str().as_bytes());
        hasher.update(&count.to_le_bytes());
        hasher.update(&now.to_le_bytes());
        let digest = hasher.finalize();

        let mut local_id = hex::encode(digest.as_bytes());
        local_id.truncate(GENERATED_ID_LENGTH);
        MeshObjectIdentifier {
            network: self.network.clone(),
            local_id,
        }
    }
}

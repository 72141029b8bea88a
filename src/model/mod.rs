//! Model: property values and the type registry.

pub mod types;
pub mod value;

pub use types::{EntityType, PropertyType, RelationshipType, TypeRegistry};
pub use value::PropertyValue;

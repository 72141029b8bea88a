//! Property-based tests for differencer round trips
//!
//! Applying the changes between two snapshot sets to the first must yield the
//! second, for arbitrary sets over a small shared pool of objects.

use netmesh::differencer::{apply, diff, diff_object};
use netmesh::mesh::SnapshotSet;
use netmesh::{MeshObjectIdentifier, MeshObjectSnapshot, NetworkIdentifier, PropertyValue};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const TYPES: [&str; 3] = ["Library", "Tag", "Counter"];
const PROPERTIES: [&str; 3] = ["name", "count", "color"];
const ROLES: [&str; 3] = ["Tagged-S", "Tagged-D", "Shelved-S"];

fn id(index: usize) -> MeshObjectIdentifier {
    let net = NetworkIdentifier::parse("sim://alpha").unwrap();
    MeshObjectIdentifier::new(&net, &format!("obj-{}", index)).unwrap()
}

type Parts = (
    BTreeSet<usize>,
    BTreeMap<usize, i64>,
    BTreeMap<usize, BTreeSet<usize>>,
);

fn parts_strategy() -> impl Strategy<Value = Parts> {
    (
        prop::collection::btree_set(0usize..TYPES.len(), 0..=TYPES.len()),
        prop::collection::btree_map(0usize..PROPERTIES.len(), -5i64..5, 0..=PROPERTIES.len()),
        prop::collection::btree_map(
            0usize..5,
            prop::collection::btree_set(0usize..ROLES.len(), 1..=ROLES.len()),
            0..4,
        ),
    )
}

fn snapshot_set_strategy() -> impl Strategy<Value = BTreeMap<usize, Parts>> {
    prop::collection::btree_map(0usize..5, parts_strategy(), 0..5)
}

fn build(raw: &BTreeMap<usize, Parts>) -> SnapshotSet {
    raw.iter()
        .map(|(index, (types, properties, neighbors))| {
            let mut snapshot = MeshObjectSnapshot::new(id(*index));
            snapshot.types = types.iter().map(|t| TYPES[*t].to_string()).collect();
            snapshot.properties = properties
                .iter()
                .map(|(p, v)| (PROPERTIES[*p].to_string(), PropertyValue::Integer(*v)))
                .collect();
            snapshot.neighbors = neighbors
                .iter()
                .filter(|(neighbor, _)| *neighbor != index)
                .map(|(neighbor, roles)| {
                    (
                        id(*neighbor),
                        roles.iter().map(|r| ROLES[*r].to_string()).collect(),
                    )
                })
                .collect();
            (snapshot.identifier.clone(), snapshot)
        })
        .collect()
}

/// Test that applying diff(a, b) to a reproduces b
#[test]
fn test_apply_diff_reproduces_target_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(
            &(snapshot_set_strategy(), snapshot_set_strategy()),
            |(raw_a, raw_b)| {
                let a = build(&raw_a);
                let b = build(&raw_b);
                let changes = diff(&a, &b);
                let mut patched = a.clone();
                apply(&mut patched, &changes);
                prop_assert_eq!(patched, b);
                Ok(())
            },
        )
        .unwrap();
}

/// Test that a set compared with itself yields no changes
#[test]
fn test_diff_with_self_is_empty_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&snapshot_set_strategy(), |raw| {
            let set = build(&raw);
            prop_assert!(diff(&set, &set).is_empty());
            Ok(())
        })
        .unwrap();
}

/// Test that diffing is deterministic
#[test]
fn test_diff_is_deterministic_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(
            &(snapshot_set_strategy(), snapshot_set_strategy()),
            |(raw_a, raw_b)| {
                let a = build(&raw_a);
                let b = build(&raw_b);
                prop_assert_eq!(diff(&a, &b), diff(&a, &b));
                Ok(())
            },
        )
        .unwrap();
}

/// Test that every change of a single-object diff refers to that object
#[test]
fn test_object_diff_stays_on_object_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(parts_strategy(), parts_strategy()), |(old, new)| {
            let old = build(&BTreeMap::from([(0, old)]));
            let new = build(&BTreeMap::from([(0, new)]));
            let identifier = id(0);
            let changes = diff_object(old.get(&identifier), new.get(&identifier));
            for change in changes {
                prop_assert_eq!(change.identifier(), &identifier);
            }
            Ok(())
        })
        .unwrap();
}

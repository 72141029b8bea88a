//! Property-based tests for lock epoch ordering

use netmesh::{LockEpoch, NetworkIdentifier};
use proptest::prelude::*;
use std::cmp::Ordering;

const HOSTS: [&str; 3] = ["sim://alpha", "sim://beta", "sim://gamma"];

fn host(index: usize) -> NetworkIdentifier {
    NetworkIdentifier::parse(HOSTS[index]).unwrap()
}

fn epoch_strategy() -> impl Strategy<Value = LockEpoch> {
    (0u64..4, 0u64..6, 0usize..HOSTS.len()).prop_map(|(generation, counter, origin)| LockEpoch {
        generation,
        counter,
        origin: host(origin),
    })
}

/// Test that epochs compare equal only when every field matches
#[test]
fn test_epoch_order_is_total_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(epoch_strategy(), epoch_strategy()), |(a, b)| {
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
            prop_assert_eq!(a.is_newer_than(&b), a > b);
            Ok(())
        })
        .unwrap();
}

/// Test that ordering is transitive
#[test]
fn test_epoch_order_is_transitive_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(
            &(epoch_strategy(), epoch_strategy(), epoch_strategy()),
            |(a, b, c)| {
                if a <= b && b <= c {
                    prop_assert!(a <= c);
                }
                Ok(())
            },
        )
        .unwrap();
}

/// Test that the next epoch outranks its predecessor whoever issues it
#[test]
fn test_next_is_newer_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(epoch_strategy(), 0usize..HOSTS.len()), |(epoch, issuer)| {
            let next = epoch.next(&host(issuer));
            prop_assert!(next.is_newer_than(&epoch));
            prop_assert!(!epoch.is_newer_than(&next));
            prop_assert_eq!(next.generation, epoch.generation);
            Ok(())
        })
        .unwrap();
}

/// Test that a reclaim outranks any chain of grants from the same generation
#[test]
fn test_reclaim_outranks_grant_chain_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(
            &(
                epoch_strategy(),
                prop::collection::vec(0usize..HOSTS.len(), 0..12),
                0usize..HOSTS.len(),
            ),
            |(start, issuers, home)| {
                let reclaimed = start.reclaimed(&host(home));
                let mut chained = start.clone();
                for issuer in issuers {
                    chained = chained.next(&host(issuer));
                    prop_assert!(reclaimed.is_newer_than(&chained));
                }
                prop_assert!(reclaimed.is_newer_than(&start));
                Ok(())
            },
        )
        .unwrap();
}

/// Test that concurrent issues of the same position favour the lower origin
#[test]
fn test_lower_origin_wins_ties_property() {
    let mut runner = proptest::test_runner::TestRunner::default();
    runner
        .run(&(epoch_strategy(), 0usize..HOSTS.len(), 0usize..HOSTS.len()), |(epoch, x, y)| {
            let from_x = epoch.next(&host(x));
            let from_y = epoch.next(&host(y));
            prop_assert_eq!(from_x.cmp(&from_y), host(y).cmp(&host(x)));
            Ok(())
        })
        .unwrap();
}

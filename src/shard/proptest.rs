//! Property-Based Tests for Shard Maintenance
//!
//! # Test Properties
//!
//! 1. **Idempotent insertion**: add(O); add(O) == add(O)
//! 2. **Retract/insert round trip**: rm(O); add(O) restores the prior state
//! 3. **Reverse consistency**: moving an object from values V1 to V2 leaves
//!    its key under every V2 entry and under no V1 entry

#![cfg(test)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::definition::ShardDefinition;
use super::index::Shard;
use super::store::IndexStore;
use crate::directory::DirectoryObject;

// =============================================================================
// Property Strategies
// =============================================================================

/// Small alphabet so that generated objects overlap
fn uid_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["alice", "bob", "carol", "dave", "erin", "frank"])
        .prop_map(str::to_string)
}

fn uids_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(uid_strategy(), 0..6)
}

fn group_dn_strategy() -> impl Strategy<Value = String> {
    (0u8..4).prop_map(|n| format!("cn=grp{},cn=groups,dc=example", n))
}

/// Two disjoint, non-empty value sets
fn disjoint_sets_strategy() -> impl Strategy<Value = (Vec<String>, Vec<String>)> {
    prop::sample::subsequence(
        vec![
            "uid=a,dc=x", "uid=b,dc=x", "uid=c,dc=x", "uid=d,dc=x", "uid=e,dc=x", "uid=f,dc=x",
        ],
        2..=6,
    )
    .prop_flat_map(|picked| {
        let len = picked.len();
        (Just(picked), 1..len)
    })
    .prop_map(|(picked, split)| {
        let picked: Vec<String> = picked.into_iter().map(str::to_string).collect();
        (picked[..split].to_vec(), picked[split..].to_vec())
    })
}

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    _dir: tempfile::TempDir,
    shard: Shard,
}

fn fixture(def: ShardDefinition) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = IndexStore::open(dir.path(), 16, 4).unwrap();
    let shard = Shard::open(&store, def).unwrap();
    Fixture { _dir: dir, shard }
}

fn member_uid_def(single_value: bool) -> ShardDefinition {
    let def = ShardDefinition::new("memberUids", "entryDN", "memberUid", "(objectClass=posixGroup)");
    if single_value {
        def.single_value()
    } else {
        def
    }
}

fn group(dn: &str, uids: &[String]) -> DirectoryObject {
    DirectoryObject::new(dn)
        .attr("objectClass", ["posixGroup"])
        .attr("memberUid", uids.iter().cloned())
        .attr("uniqueMember", uids.iter().map(|u| format!("uid={},dc=x", u)))
}

fn dump(shard: &Shard) -> Vec<(String, Vec<String>)> {
    shard.entries(None).unwrap()
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: inserting the same snapshot twice equals inserting it once.
    #[test]
    fn prop_add_is_idempotent(
        single_value in any::<bool>(),
        seed in prop::collection::vec((group_dn_strategy(), uids_strategy()), 0..4),
        dn in group_dn_strategy(),
        uids in uids_strategy(),
    ) {
        let fx = fixture(member_uid_def(single_value));
        for (seed_dn, seed_uids) in &seed {
            fx.shard.add_object(&group(seed_dn, seed_uids)).unwrap();
        }
        let obj = group(&dn, &uids);

        fx.shard.add_object(&obj).unwrap();
        let once = dump(&fx.shard);
        fx.shard.add_object(&obj).unwrap();
        let twice = dump(&fx.shard);

        prop_assert_eq!(once, twice);
    }

    /// Property: retracting then re-inserting an indexed object is a no-op.
    #[test]
    fn prop_rm_then_add_round_trip(
        single_value in any::<bool>(),
        others in prop::collection::vec((group_dn_strategy(), uids_strategy()), 0..4),
        dn in group_dn_strategy(),
        uids in uids_strategy(),
    ) {
        let fx = fixture(member_uid_def(single_value));
        for (other_dn, other_uids) in &others {
            if other_dn != &dn {
                fx.shard.add_object(&group(other_dn, other_uids)).unwrap();
            }
        }
        let obj = group(&dn, &uids);
        fx.shard.add_object(&obj).unwrap();
        let before = dump(&fx.shard);

        fx.shard.rm_object(&obj).unwrap();
        fx.shard.add_object(&obj).unwrap();

        prop_assert_eq!(before, dump(&fx.shard));
    }

    /// Property: a reverse shard follows a value change exactly.
    #[test]
    fn prop_reverse_follows_modify(
        (v1, v2) in disjoint_sets_strategy(),
        dn in group_dn_strategy(),
    ) {
        let def = ShardDefinition::new("groupsOfMember", "entryDN", "uniqueMember", "(objectClass=posixGroup)")
            .reverse();
        let fx = fixture(def);

        let old = DirectoryObject::new(dn.clone())
            .attr("objectClass", ["posixGroup"])
            .attr("uniqueMember", v1.clone());
        let new = DirectoryObject::new(dn.clone())
            .attr("objectClass", ["posixGroup"])
            .attr("uniqueMember", v2.clone());

        fx.shard.add_object(&old).unwrap();
        fx.shard.replace(Some(&old), Some(&new)).unwrap();

        for value in &v1 {
            let groups = fx.shard.get(value, None).unwrap();
            prop_assert!(!groups.contains(&dn), "{} still lists {}", value, dn);
        }
        for value in &v2 {
            let groups: BTreeSet<String> = fx.shard.get(value, None).unwrap().into_iter().collect();
            prop_assert!(groups.contains(&dn), "{} is missing {}", value, dn);
        }
    }
}

//! Built-in shards
//!
//! The membership shards every deployment needs, wired in ahead of the
//! custom definitions from the registry.

use crate::directory::ENTRY_DN;
use crate::shard::ShardDefinition;

/// Group DN -> member DNs
pub const UNIQUE_MEMBERS: &str = "uniqueMembers";

/// Group DN -> member uids
pub const MEMBER_UIDS: &str = "memberUids";

/// Member DN -> group DNs
pub const GROUPS_OF_MEMBER: &str = "groupsOfMember";

/// Entry DN -> entryUUID
pub const ENTRY_UUIDS: &str = "entryUUIDs";

const GROUP_FILTER: &str = "(objectClass=posixGroup)";

/// Definitions of every built-in shard
pub fn definitions() -> Vec<ShardDefinition> {
    vec![
        ShardDefinition::new(UNIQUE_MEMBERS, ENTRY_DN, "uniqueMember", GROUP_FILTER),
        ShardDefinition::new(MEMBER_UIDS, ENTRY_DN, "memberUid", GROUP_FILTER),
        ShardDefinition::new(GROUPS_OF_MEMBER, ENTRY_DN, "uniqueMember", GROUP_FILTER).reverse(),
        ShardDefinition::new(ENTRY_UUIDS, ENTRY_DN, "entryUUID", "(entryUUID=*)").single_value(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_definitions_are_valid() {
        let defs = definitions();
        assert_eq!(defs.len(), 4);
        for def in &defs {
            def.validate().unwrap();
        }
        assert!(defs.iter().any(|d| d.db_name() == GROUPS_OF_MEMBER && d.is_reverse()));
        assert!(defs.iter().any(|d| d.db_name() == ENTRY_UUIDS && d.is_single_value()));
    }
}

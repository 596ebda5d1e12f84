//! Membership Resolution
//!
//! Read-only queries over the built-in membership shards:
//!
//! - [`groups_for_user`]: groups an identity belongs to, following nested
//!   groups upwards through `uniqueMembers`
//! - [`users_in_group`]: users of a group, following nested groups downwards
//!   through `uniqueMembers` and classifying members via `memberUids`
//!
//! Both take an optional [`Reader`] and thread one read transaction through
//! the whole query. Store errors propagate; a partial answer is never
//! returned as complete.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::builtin::{MEMBER_UIDS, UNIQUE_MEMBERS};
use crate::cache::CacheEngine;
use crate::directory::first_rdn_value;
use crate::error::Result;
use crate::shard::{Reader, Shard};

/// Suffix marking machine accounts in `memberUid`
const MACHINE_ACCOUNT_MARKER: char = '$';

/// Groups whose `uniqueMember` contains `user_dn`, sorted and lower-cased.
///
/// With `nested`, groups containing those groups are added until no new
/// group appears. The queried identity itself is never part of the result,
/// even when a membership cycle leads back to it.
pub fn groups_for_user(
    engine: &CacheEngine,
    user_dn: &str,
    nested: bool,
    reader: Option<&Reader>,
) -> Result<Vec<String>> {
    let members = engine.get_sub_cache(UNIQUE_MEMBERS)?;
    let reader = engine.reading(reader)?;

    // Scan once, the walk below stays in memory
    let index: Vec<(String, BTreeSet<String>)> = members
        .entries(Some(&*reader))?
        .into_iter()
        .map(|(group, values)| {
            let values = values.iter().map(|v| v.to_lowercase()).collect();
            (group, values)
        })
        .collect();

    let seed = user_dn.to_lowercase();
    let mut visited: HashSet<String> = HashSet::from([seed.clone()]);
    let mut found = BTreeSet::new();
    let mut queue = VecDeque::from([seed]);

    while let Some(identity) = queue.pop_front() {
        for (group, values) in &index {
            if !values.contains(&identity) || !visited.insert(group.clone()) {
                continue;
            }
            trace!(member = %identity, group = %group, "Found membership");
            found.insert(group.clone());
            if nested {
                queue.push_back(group.clone());
            }
        }
    }

    debug!(user = %user_dn, nested, groups = found.len(), "Resolved groups for user");
    Ok(found.into_iter().collect())
}

/// Users of `group_dn`, sorted and lower-cased.
///
/// A member reference is a user when the value of its first RDN appears in
/// the group's `memberUid`; when the value followed by `$` appears instead it
/// is a machine account and skipped. Anything else is taken for a nested
/// group and, with `nested`, resolved recursively. Every group is expanded at
/// most once per query.
pub fn users_in_group(
    engine: &CacheEngine,
    group_dn: &str,
    nested: bool,
    reader: Option<&Reader>,
) -> Result<Vec<String>> {
    let reader = engine.reading(reader)?;
    let mut walk = GroupWalk {
        unique_members: engine.get_sub_cache(UNIQUE_MEMBERS)?,
        member_uids: None,
        engine,
        reader: &*reader,
        nested,
        visited: HashSet::new(),
        users: BTreeSet::new(),
    };
    walk.expand(group_dn)?;

    debug!(group = %group_dn, nested, users = walk.users.len(), "Resolved users in group");
    Ok(walk.users.into_iter().collect())
}

/// State of one `users_in_group` query
struct GroupWalk<'q> {
    engine: &'q CacheEngine,
    reader: &'q Reader,
    unique_members: Arc<Shard>,
    /// Resolved on first use
    member_uids: Option<Arc<Shard>>,
    nested: bool,
    visited: HashSet<String>,
    users: BTreeSet<String>,
}

impl GroupWalk<'_> {
    fn expand(&mut self, group_dn: &str) -> Result<()> {
        if !self.visited.insert(group_dn.to_lowercase()) {
            trace!(group = %group_dn, "Group already expanded");
            return Ok(());
        }

        let members = self.unique_members.get(group_dn, Some(self.reader))?;
        if members.is_empty() {
            return Ok(());
        }

        let uids: HashSet<String> = self
            .member_uids()?
            .get(group_dn, Some(self.reader))?
            .into_iter()
            .collect();

        for member in members {
            let id = first_rdn_value(&member);
            if uids.contains(id) {
                self.users.insert(member.to_lowercase());
            } else if uids.contains(&format!("{}{}", id, MACHINE_ACCOUNT_MARKER)) {
                trace!(member = %member, "Skipping machine account");
            } else if self.nested {
                self.expand(&member)?;
            }
        }
        Ok(())
    }

    fn member_uids(&mut self) -> Result<Arc<Shard>> {
        if let Some(shard) = &self.member_uids {
            return Ok(Arc::clone(shard));
        }
        let shard = self.engine.get_sub_cache(MEMBER_UIDS)?;
        self.member_uids = Some(Arc::clone(&shard));
        Ok(shard)
    }
}

// =============================================================================
// Tests
// =============================================================================

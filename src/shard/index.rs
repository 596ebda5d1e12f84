//! Shard - one derived key -> value(s) index
//!
//! Translates a directory object snapshot into index contributions and
//! applies them as insertions or retractions.
//!
//! # Record layout
//!
//! ```text
//! forward, multi-value   key  -> {value, ...}
//! forward, single-value  key  -> {value}          (last write wins)
//! reverse                value -> {key, ...}       (one contribution per value)
//! ```
//!
//! Keys are stored lower-cased. An update is always a retraction of the old
//! snapshot followed by an insertion of the new one, so values an object no
//! longer carries never linger in the index.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use heed::types::Bytes;
use heed::{Env, RoTxn, RwTxn};
use tracing::{debug, trace};

use super::definition::ShardDefinition;
use super::store::{IndexDb, IndexStore, Reader};
use crate::directory::{DirectoryObject, Filter};
use crate::error::Result;

/// Index contribution of one object: key plus the values it adds
pub type Contribution = (String, BTreeSet<String>);

/// A single persistent index
pub struct Shard {
    /// Definition the shard was built from
    definition: ShardDefinition,
    /// Parsed selecting filter
    filter: Filter,
    /// Environment owning the database
    env: Env,
    /// Named database
    db: IndexDb,
    /// Number of lookups
    reads: AtomicU64,
    /// Number of applied mutations
    writes: AtomicU64,
}

impl Shard {
    /// Open the shard's database in `store`.
    ///
    /// Fails with a configuration error when the definition or its filter is
    /// malformed, and with a store error when the database cannot be opened.
    pub fn open(store: &IndexStore, definition: ShardDefinition) -> Result<Self> {
        definition.validate()?;
        let filter = Filter::parse(definition.ldap_filter())?;
        let db = store.create_index(definition.db_name())?;

        debug!(shard = %definition.db_name(), filter = %filter, "Opened shard");
        Ok(Self {
            definition,
            filter,
            env: store.env().clone(),
            db,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Shard name (`db_name`)
    pub fn name(&self) -> &str {
        self.definition.db_name()
    }

    pub fn definition(&self) -> &ShardDefinition {
        &self.definition
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Whether the shard is interested in `obj`
    pub fn matches(&self, obj: &DirectoryObject) -> bool {
        self.filter.matches(obj)
    }

    /// Key/value contributions of `obj`, or `None` when it has no key.
    ///
    /// Forward shards yield one contribution (possibly with no values);
    /// reverse shards yield one per value. Empty strings are neither keys
    /// nor values.
    pub fn extract(&self, obj: &DirectoryObject) -> Option<Vec<Contribution>> {
        let key = obj
            .values(self.definition.key_attribute())
            .into_iter()
            .find(|key| !key.is_empty())?;
        let values: Vec<&str> = obj
            .values(self.definition.value_attribute())
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect();

        if self.definition.is_reverse() {
            let contributions = values
                .into_iter()
                .map(|value| (normalize_key(value), BTreeSet::from([key.to_string()])))
                .collect();
            return Some(contributions);
        }

        let values: BTreeSet<String> = if self.definition.is_single_value() {
            values.into_iter().take(1).map(str::to_string).collect()
        } else {
            values.into_iter().map(str::to_string).collect()
        };
        Some(vec![(normalize_key(key), values)])
    }

    /// Merge the contributions of `obj` in a transaction of its own
    pub fn add_object(&self, obj: &DirectoryObject) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.insert_in(&mut wtxn, obj)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Retract the contributions of a previous snapshot in a transaction of
    /// its own
    pub fn rm_object(&self, obj: &DirectoryObject) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.remove_in(&mut wtxn, obj)?;
        wtxn.commit()?;
        Ok(())
    }

    /// Retract `old` and insert `new` atomically.
    ///
    /// The caller decides whether `new` still belongs in this shard.
    pub fn replace(
        &self,
        old: Option<&DirectoryObject>,
        new: Option<&DirectoryObject>,
    ) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        if let Some(old) = old {
            self.remove_in(&mut wtxn, old)?;
        }
        if let Some(new) = new {
            self.insert_in(&mut wtxn, new)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub(crate) fn insert_in(&self, wtxn: &mut RwTxn<'_>, obj: &DirectoryObject) -> Result<()> {
        let Some(contributions) = self.extract(obj) else {
            trace!(shard = %self.name(), dn = %obj.dn, "No key, skipping insert");
            return Ok(());
        };
        self.writes.fetch_add(1, Ordering::Relaxed);

        for (key, values) in contributions {
            if values.is_empty() {
                continue;
            }
            if self.definition.is_single_value() {
                self.db.put(wtxn, &key, &values)?;
                continue;
            }
            let mut stored = self.db.get(wtxn, &key)?.unwrap_or_default();
            let before = stored.len();
            stored.extend(values);
            if stored.len() != before {
                self.db.put(wtxn, &key, &stored)?;
            }
        }
        Ok(())
    }

    pub(crate) fn remove_in(&self, wtxn: &mut RwTxn<'_>, obj: &DirectoryObject) -> Result<()> {
        let Some(contributions) = self.extract(obj) else {
            return Ok(());
        };
        self.writes.fetch_add(1, Ordering::Relaxed);

        for (key, values) in contributions {
            let Some(mut stored) = self.db.get(wtxn, &key)? else {
                continue;
            };
            let before = stored.len();
            stored.retain(|v| !values.contains(v));
            if stored.is_empty() {
                self.db.delete(wtxn, &key)?;
            } else if self.definition.is_single_value() {
                // Another object owns the key now; leave its value alone
                continue;
            } else if stored.len() != before {
                self.db.put(wtxn, &key, &stored)?;
            }
        }
        Ok(())
    }

    /// Point lookup. An absent (or empty) key yields an empty list.
    pub fn get(&self, key: &str, reader: Option<&Reader>) -> Result<Vec<String>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if key.is_empty() {
            return Ok(Vec::new());
        }
        let key = normalize_key(key);
        let found = match reader {
            Some(reader) => self.db.get(reader.txn(), &key)?,
            None => {
                let rtxn = self.env.read_txn()?;
                self.db.get(&rtxn, &key)?
            }
        };
        Ok(found.map(|set| set.into_iter().collect()).unwrap_or_default())
    }

    /// Lookup for single-value shards
    pub fn get_one(&self, key: &str, reader: Option<&Reader>) -> Result<Option<String>> {
        Ok(self.get(key, reader)?.into_iter().next())
    }

    /// Every key with its values, in key order
    pub fn entries(&self, reader: Option<&Reader>) -> Result<Vec<(String, Vec<String>)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match reader {
            Some(reader) => self.collect_entries(reader.txn()),
            None => {
                let rtxn = self.env.read_txn()?;
                self.collect_entries(&rtxn)
            }
        }
    }

    fn collect_entries(&self, txn: &RoTxn<'_>) -> Result<Vec<(String, Vec<String>)>> {
        let mut out = Vec::new();
        for item in self.db.iter(txn)? {
            let (key, values) = item?;
            out.push((key.to_string(), values.into_iter().collect()));
        }
        Ok(out)
    }

    /// Number of keys
    pub fn len(&self, reader: Option<&Reader>) -> Result<u64> {
        match reader {
            Some(reader) => Ok(self.db.len(reader.txn())?),
            None => {
                let rtxn = self.env.read_txn()?;
                Ok(self.db.len(&rtxn)?)
            }
        }
    }

    pub fn is_empty(&self, reader: Option<&Reader>) -> Result<bool> {
        Ok(self.len(reader)? == 0)
    }

    /// Drop records that are empty or no longer decode. Returns the number
    /// of records removed.
    ///
    /// Runs in one write transaction; concurrent readers keep their snapshot.
    pub fn cleanup(&self) -> Result<usize> {
        let raw = self.db.remap_types::<Bytes, Bytes>();
        let mut wtxn = self.env.write_txn()?;

        let mut stale = Vec::new();
        for item in raw.iter(&wtxn)? {
            let (key, value) = item?;
            let usable = std::str::from_utf8(key).is_ok()
                && serde_json::from_slice::<BTreeSet<String>>(value)
                    .map(|set| !set.is_empty())
                    .unwrap_or(false);
            if !usable {
                stale.push(key.to_vec());
            }
        }

        for key in &stale {
            raw.delete(&mut wtxn, key.as_slice())?;
        }
        wtxn.commit()?;

        if !stale.is_empty() {
            debug!(shard = %self.name(), purged = stale.len(), "Purged stale records");
        }
        Ok(stale.len())
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("definition", &self.definition)
            .field("reads", &self.read_count())
            .field("writes", &self.write_count())
            .finish()
    }
}

fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, IndexStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::open(dir.path(), 16, 8).unwrap();
        (dir, store)
    }

    fn member_uids(store: &IndexStore) -> Shard {
        let def = ShardDefinition::new("memberUids", "entryDN", "memberUid", "(objectClass=posixGroup)");
        Shard::open(store, def).unwrap()
    }

    fn group(dn: &str, uids: &[&str]) -> DirectoryObject {
        DirectoryObject::new(dn)
            .attr("objectClass", ["posixGroup"])
            .attr("memberUid", uids.iter().copied())
    }

    #[test]
    fn test_open_rejects_bad_filter() {
        let (_dir, store) = store();
        let def = ShardDefinition::new("broken", "entryDN", "memberUid", "(memberUid=*");
        assert!(Shard::open(&store, def).is_err());
    }

    #[test]
    fn test_extract_forward() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        let obj = group("CN=Grp1,dc=example", &["alice", "bob"]);

        let contributions = shard.extract(&obj).unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].0, "cn=grp1,dc=example");
        assert_eq!(
            contributions[0].1,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn test_extract_without_key() {
        let (_dir, store) = store();
        let def = ShardDefinition::new("byUuid", "entryUUID", "uid", "(uid=*)");
        let shard = Shard::open(&store, def).unwrap();
        let obj = DirectoryObject::new("uid=alice").attr("uid", ["alice"]);
        assert!(shard.extract(&obj).is_none());
    }

    #[test]
    fn test_extract_drops_empty_strings() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        let obj = DirectoryObject::new("cn=grp1")
            .attr("objectClass", ["posixGroup"])
            .attr("memberUid", ["", "alice"]);
        let contributions = shard.extract(&obj).unwrap();
        assert_eq!(contributions[0].1, BTreeSet::from(["alice".to_string()]));

        let def = ShardDefinition::new("groupsOfUid", "entryDN", "memberUid", "(memberUid=*)")
            .reverse();
        let reverse = Shard::open(&store, def).unwrap();
        let contributions = reverse.extract(&obj).unwrap();
        assert_eq!(contributions.len(), 1);
        assert_eq!(contributions[0].0, "alice");

        let def = ShardDefinition::new("byMail", "mail", "uid", "(uid=*)");
        let by_mail = Shard::open(&store, def).unwrap();
        let keyless = DirectoryObject::new("uid=bob").attr("mail", [""]).attr("uid", ["bob"]);
        assert!(by_mail.extract(&keyless).is_none());
    }

    #[test]
    fn test_empty_key_lookup_is_a_miss() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.add_object(&group("cn=grp1", &["", "alice"])).unwrap();

        assert!(shard.get("", None).unwrap().is_empty());
        assert_eq!(shard.get_one("", None).unwrap(), None);
        assert_eq!(shard.get("cn=grp1", None).unwrap(), vec!["alice"]);

        shard.rm_object(&group("cn=grp1", &["", "alice"])).unwrap();
        assert!(shard.is_empty(None).unwrap());
    }

    #[test]
    fn test_extract_reverse() {
        let (_dir, store) = store();
        let def = ShardDefinition::new("groupsOfUid", "entryDN", "memberUid", "(memberUid=*)")
            .reverse();
        let shard = Shard::open(&store, def).unwrap();
        let obj = group("cn=grp1,dc=example", &["Alice", "bob"]);

        let contributions = shard.extract(&obj).unwrap();
        assert_eq!(contributions.len(), 2);
        assert_eq!(contributions[0].0, "alice");
        assert_eq!(
            contributions[0].1,
            BTreeSet::from(["cn=grp1,dc=example".to_string()])
        );
    }

    #[test]
    fn test_add_get_remove() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        let obj = group("cn=grp1,dc=example", &["alice", "bob"]);

        shard.add_object(&obj).unwrap();
        assert_eq!(shard.get("CN=GRP1,DC=EXAMPLE", None).unwrap(), vec!["alice", "bob"]);

        shard.rm_object(&obj).unwrap();
        assert!(shard.get("cn=grp1,dc=example", None).unwrap().is_empty());
        assert!(shard.is_empty(None).unwrap());
    }

    #[test]
    fn test_remove_keeps_other_values() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.add_object(&group("cn=grp1", &["alice", "bob"])).unwrap();

        shard.rm_object(&group("cn=grp1", &["alice"])).unwrap();
        assert_eq!(shard.get("cn=grp1", None).unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.rm_object(&group("cn=nobody", &["alice"])).unwrap();
        assert!(shard.is_empty(None).unwrap());
    }

    #[test]
    fn test_single_value_last_write_wins() {
        let (_dir, store) = store();
        let def = ShardDefinition::new("entryUUIDs", "entryDN", "entryUUID", "(entryUUID=*)")
            .single_value();
        let shard = Shard::open(&store, def).unwrap();

        let first = DirectoryObject::new("uid=alice").attr("entryUUID", ["u-1", "u-extra"]);
        let second = DirectoryObject::new("uid=alice").attr("entryUUID", ["u-2"]);

        shard.add_object(&first).unwrap();
        assert_eq!(shard.get_one("uid=alice", None).unwrap().as_deref(), Some("u-1"));

        shard.add_object(&second).unwrap();
        assert_eq!(shard.get("uid=alice", None).unwrap(), vec!["u-2"]);

        // Retracting a value the key no longer holds leaves it in place
        shard.rm_object(&first).unwrap();
        assert_eq!(shard.get_one("uid=alice", None).unwrap().as_deref(), Some("u-2"));
    }

    #[test]
    fn test_replace_moves_values() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        let old = group("cn=grp1", &["alice", "bob"]);
        let new = group("cn=grp1", &["bob", "carol"]);

        shard.add_object(&old).unwrap();
        shard.replace(Some(&old), Some(&new)).unwrap();
        assert_eq!(shard.get("cn=grp1", None).unwrap(), vec!["bob", "carol"]);
    }

    #[test]
    fn test_get_with_outer_reader() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.add_object(&group("cn=grp1", &["alice"])).unwrap();

        let reader = store.read().unwrap();
        assert_eq!(shard.get("cn=grp1", Some(&reader)).unwrap(), vec!["alice"]);
        assert_eq!(shard.entries(Some(&reader)).unwrap().len(), 1);
        assert_eq!(shard.len(Some(&reader)).unwrap(), 1);
    }

    #[test]
    fn test_counters() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.add_object(&group("cn=grp1", &["alice"])).unwrap();
        shard.get("cn=grp1", None).unwrap();
        shard.get("cn=grp2", None).unwrap();

        assert_eq!(shard.write_count(), 1);
        assert_eq!(shard.read_count(), 2);
    }

    #[test]
    fn test_cleanup_purges_empty_and_corrupt_records() {
        let (_dir, store) = store();
        let shard = member_uids(&store);
        shard.add_object(&group("cn=keep", &["alice"])).unwrap();

        let raw = shard.db.remap_types::<Bytes, Bytes>();
        let mut wtxn = store.env().write_txn().unwrap();
        raw.put(&mut wtxn, b"cn=empty", b"[]").unwrap();
        raw.put(&mut wtxn, b"cn=corrupt", b"not json").unwrap();
        wtxn.commit().unwrap();

        assert_eq!(shard.len(None).unwrap(), 3);
        assert_eq!(shard.cleanup().unwrap(), 2);
        assert_eq!(shard.len(None).unwrap(), 1);
        assert_eq!(shard.get("cn=keep", None).unwrap(), vec!["alice"]);

        assert_eq!(shard.cleanup().unwrap(), 0);
    }
}

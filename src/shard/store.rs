//! LMDB-backed index storage
//!
//! One environment per storage root; every shard is a named database in it.
//! LMDB gives many concurrent readers and one writer per environment, so
//! readers never block on a running cleanup and see a consistent snapshot.
//!
//! # Reentrant reads
//!
//! Read transactions are not bound to thread-local reader slots
//! (`read-txn-no-tls`), so a thread holding a [`Reader`] can still start an
//! independent query with a reader of its own. Recursive lookups pass the
//! transaction they already hold down the call chain instead:
//! [`IndexStore::reading`] wraps an outer [`Reader`] rather than opening a
//! second one, and every lookup of one query sees the same snapshot.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use tracing::debug;

use crate::error::Result;

/// Key -> ordered value set
pub type IndexDb = Database<Str, SerdeJson<BTreeSet<String>>>;

/// Shared storage environment for all shards of one cache
#[derive(Clone)]
pub struct IndexStore {
    env: Env,
    root: PathBuf,
}

impl IndexStore {
    /// Open (or create) the environment under `root`
    pub fn open(root: &Path, map_size_mb: usize, max_dbs: u32) -> Result<Self> {
        std::fs::create_dir_all(root)?;

        // SAFETY: the environment is opened once per root and never mapped
        // by this process through another handle.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(max_dbs)
                .open(root)?
        };

        debug!(root = %root.display(), map_size_mb, max_dbs, "Opened index store");
        Ok(Self {
            env,
            root: root.to_path_buf(),
        })
    }

    /// Open (or create) the named database of a shard
    pub fn create_index(&self, name: &str) -> Result<IndexDb> {
        let mut wtxn = self.env.write_txn()?;
        let db: IndexDb = self.env.create_database(&mut wtxn, Some(name))?;
        wtxn.commit()?;
        Ok(db)
    }

    /// Underlying environment
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a read transaction over every shard
    pub fn read(&self) -> Result<Reader> {
        Ok(Reader {
            txn: self.env.clone().static_read_txn()?,
        })
    }

    /// Reuse `outer` when given, otherwise acquire a fresh reader.
    ///
    /// The returned handle releases an acquired transaction when dropped and
    /// leaves a borrowed one untouched.
    pub fn reading<'r>(&self, outer: Option<&'r Reader>) -> Result<ReaderHandle<'r>> {
        match outer {
            Some(reader) => Ok(ReaderHandle::Borrowed(reader)),
            None => Ok(ReaderHandle::Acquired(self.read()?)),
        }
    }
}

/// An open read transaction granting access to every shard of a store
pub struct Reader {
    txn: RoTxn<'static>,
}

impl Reader {
    pub(crate) fn txn(&self) -> &RoTxn<'static> {
        &self.txn
    }
}

/// Scoped read access: either acquired here or borrowed from a caller
pub enum ReaderHandle<'r> {
    /// Opened by this scope, closed when the handle drops
    Acquired(Reader),
    /// Owned by an enclosing scope
    Borrowed(&'r Reader),
}

impl ReaderHandle<'_> {
    /// Whether this handle opened its own transaction
    pub fn is_acquired(&self) -> bool {
        matches!(self, ReaderHandle::Acquired(_))
    }
}

impl Deref for ReaderHandle<'_> {
    type Target = Reader;

    fn deref(&self) -> &Reader {
        match self {
            ReaderHandle::Acquired(reader) => reader,
            ReaderHandle::Borrowed(reader) => reader,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

//! Shard Registry
//!
//! Durable list of operator-declared shard definitions, stored as a JSON
//! array next to an advisory lock file.
//!
//! Reads are tolerant: a missing or unreadable document means "no custom
//! shards". Mutations are read-modify-write under an exclusive lock and
//! replace the document atomically, so concurrent `add`/`remove` calls never
//! drop each other's change. Entries that do not decode are carried over
//! untouched on rewrite.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::shard::ShardDefinition;

/// Persistent set of custom shard definitions
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    path: PathBuf,
}

impl ShardRegistry {
    /// Registry backed by the JSON document at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the JSON document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every well-formed definition, in document order.
    ///
    /// Never fails: problems are logged and yield fewer (or no) definitions.
    pub fn load_definitions(&self) -> Vec<ShardDefinition> {
        let entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable shard configuration");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .enumerate()
            .filter_map(|(idx, entry)| match decode(&entry) {
                Ok(def) => Some(def),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        index = idx,
                        error = %e,
                        "Skipping malformed shard definition"
                    );
                    None
                }
            })
            .collect()
    }

    /// Add `def` unless an equal definition exists. Returns whether the
    /// document changed.
    pub fn add_definition(&self, def: &ShardDefinition) -> Result<bool> {
        def.validate()?;
        let _lock = RegistryLock::acquire(&self.lock_path()?)?;

        let mut entries = self.read_entries()?;
        if entries.iter().any(|entry| decode(entry).ok().as_ref() == Some(def)) {
            debug!(shard = %def.db_name(), "Shard definition already registered");
            return Ok(false);
        }

        entries.push(serde_json::to_value(def)?);
        self.write_entries(&entries)?;
        info!(shard = %def, "Registered shard definition");
        Ok(true)
    }

    /// Remove every entry equal to `def`. Removing an absent definition is a
    /// no-op. Returns whether the document changed.
    pub fn remove_definition(&self, def: &ShardDefinition) -> Result<bool> {
        let _lock = RegistryLock::acquire(&self.lock_path()?)?;

        let mut entries = self.read_entries()?;
        let before = entries.len();
        entries.retain(|entry| decode(entry).ok().as_ref() != Some(def));
        if entries.len() == before {
            debug!(shard = %def.db_name(), "Shard definition not registered");
            return Ok(false);
        }

        self.write_entries(&entries)?;
        info!(shard = %def, "Removed shard definition");
        Ok(true)
    }

    /// Raw entries; a missing document is an empty list
    fn read_entries(&self) -> Result<Vec<Value>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No shard configuration found");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Array(entries) => Ok(entries),
            _ => Err(Error::Config(format!(
                "{} does not contain a list of shard definitions",
                self.path.display()
            ))),
        }
    }

    /// Replace the document: four-space indentation, sorted object keys
    fn write_entries(&self, entries: &[Value]) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        entries.serialize(&mut ser)?;
        buf.push(b'\n');

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn lock_path(&self) -> Result<PathBuf> {
        let mut name = self
            .path
            .file_name()
            .ok_or_else(|| {
                Error::Config(format!("{} is not a file path", self.path.display()))
            })?
            .to_os_string();
        name.push(".lock");
        Ok(self.path.with_file_name(name))
    }
}

fn decode(entry: &Value) -> std::result::Result<ShardDefinition, serde_json::Error> {
    ShardDefinition::deserialize(entry)
}

// =============================================================================
// Locking
// =============================================================================

/// Exclusive advisory lock on the file next to the document.
///
/// Every acquisition opens its own file description, so the lock excludes
/// other threads of this process as well as other processes.
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.lock_exclusive()?;

        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use fs2::FileExt as _;
    use std::sync::Arc;

    fn def(name: &str) -> ShardDefinition {
        ShardDefinition::new(name, "entryDN", "mail", "(mail=*)")
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ShardRegistry::new(dir.path().join("shards.json"));
        assert!(registry.load_definitions().is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ShardRegistry::new(dir.path().join("shards.json"));

        assert!(registry.add_definition(&def("mails")).unwrap());
        assert!(!registry.add_definition(&def("mails")).unwrap());
        assert_eq!(registry.load_definitions(), vec![def("mails")]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json");
        let registry = ShardRegistry::new(&path);

        assert!(!registry.remove_definition(&def("mails")).unwrap());
        assert!(!path.exists());

        registry.add_definition(&def("a")).unwrap();
        assert!(!registry.remove_definition(&def("b")).unwrap());
        assert!(registry.remove_definition(&def("a")).unwrap());
        assert!(registry.load_definitions().is_empty());
    }

    #[test]
    fn test_remove_requires_full_match() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ShardRegistry::new(dir.path().join("shards.json"));
        registry.add_definition(&def("mails")).unwrap();

        assert!(!registry.remove_definition(&def("mails").single_value()).unwrap());
        assert_eq!(registry.load_definitions().len(), 1);
    }

    #[test]
    fn test_document_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json");
        let registry = ShardRegistry::new(&path);
        registry.add_definition(&def("mails")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = r#"[
    {
        "db_name": "mails",
        "key": "entryDN",
        "ldap_filter": "(mail=*)",
        "reverse": false,
        "single_value": false,
        "value": "mail"
    }
]
"#;
        assert_eq!(text, expected);
    }

    #[test]
    fn test_malformed_entries_are_skipped_and_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json");
        std::fs::write(
            &path,
            r#"[{"db_name": "broken"}, {"db_name": "ok", "key": "entryDN", "value": "mail", "ldap_filter": "(mail=*)"}]"#,
        )
        .unwrap();
        let registry = ShardRegistry::new(&path);

        let loaded = registry.load_definitions();
        assert_eq!(loaded, vec![def("ok")]);

        registry.add_definition(&def("new")).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"broken\""));
        assert_eq!(registry.load_definitions().len(), 2);
    }

    #[test]
    fn test_unreadable_document_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json");
        std::fs::write(&path, "{ not json").unwrap();
        let registry = ShardRegistry::new(&path);

        assert!(registry.load_definitions().is_empty());
        // Mutations refuse to clobber what they cannot read
        assert!(registry.add_definition(&def("mails")).is_err());
    }

    #[test]
    fn test_lock_excludes_other_handles_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.json.lock");

        let held = RegistryLock::acquire(&path).unwrap();
        let other = File::open(&path).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        other.try_lock_exclusive().unwrap();
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ShardRegistry::new(dir.path().join("shards.json")));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.add_definition(&def(&format!("shard{}", i))).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.load_definitions().len(), 8);
    }
}

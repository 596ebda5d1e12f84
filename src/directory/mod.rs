//! Directory Object Model
//!
//! Snapshots of directory entries as delivered by the change notification
//! stream, plus the filter language used to select them.
//!
//! # Modules
//!
//! - [`filter`] - RFC 4515 string filters (parse, evaluate, canonical form)
//! - [`dn`] - Cheap first-RDN extraction for member references

pub mod dn;
pub mod filter;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use dn::first_rdn_value;
pub use filter::Filter;

/// Operational attribute holding an entry's own distinguished name.
pub const ENTRY_DN: &str = "entryDN";

/// Attribute name -> ordered list of values.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// A directory entry snapshot: distinguished name plus attribute map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryObject {
    /// Distinguished name
    pub dn: String,
    /// Attribute values keyed by attribute name
    #[serde(default)]
    pub attributes: Attributes,
}

impl DirectoryObject {
    /// Create an object without attributes
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: Attributes::new(),
        }
    }

    /// Create an object from an existing attribute map
    pub fn with_attributes(dn: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            dn: dn.into(),
            attributes,
        }
    }

    /// Builder-style attribute setter, replacing any previous values
    pub fn attr<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Values of an attribute, matched case-insensitively.
    ///
    /// `entryDN` falls back to the object's own DN when the map lacks it.
    pub fn values(&self, name: &str) -> Vec<&str> {
        if let Some(values) = self.lookup(name) {
            return values.iter().map(String::as_str).collect();
        }
        if name.eq_ignore_ascii_case(ENTRY_DN) && !self.dn.is_empty() {
            return vec![self.dn.as_str()];
        }
        Vec::new()
    }

    /// First value of an attribute, if any
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).into_iter().next()
    }

    /// Whether the attribute carries at least one value
    pub fn has(&self, name: &str) -> bool {
        !self.values(name).is_empty()
    }

    fn lookup(&self, name: &str) -> Option<&Vec<String>> {
        if let Some(values) = self.attributes.get(name) {
            return Some(values);
        }
        self.attributes
            .iter()
            .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}

// =============================================================================
// Tests
// =============================================================================

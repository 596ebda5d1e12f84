//! Shard definitions
//!
//! A definition is the full identity of a shard: two definitions are the
//! same shard iff every field compares equal. Field order matches the
//! alphabetical key order of the persisted JSON document.

use serde::{Deserialize, Serialize};

use crate::directory::ENTRY_DN;
use crate::error::{Error, Result};

/// Immutable description of one derived index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDefinition")]
pub struct ShardDefinition {
    db_name: String,
    #[serde(rename = "key")]
    key_attribute: String,
    ldap_filter: String,
    reverse: bool,
    single_value: bool,
    #[serde(rename = "value")]
    value_attribute: String,
}

impl ShardDefinition {
    /// Create a multi-value, forward definition
    pub fn new(
        db_name: impl Into<String>,
        key_attribute: impl Into<String>,
        value_attribute: impl Into<String>,
        ldap_filter: impl Into<String>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            key_attribute: key_attribute.into(),
            ldap_filter: ldap_filter.into(),
            reverse: false,
            single_value: false,
            value_attribute: value_attribute.into(),
        }
    }

    /// Keep exactly one value per key. Ignored for reverse shards.
    pub fn single_value(mut self) -> Self {
        self.single_value = !self.reverse;
        self
    }

    /// Index by the value attribute instead of the key attribute
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self.single_value = false;
        self
    }

    /// Storage namespace and lookup name
    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Source attribute of the index key (of the value for reverse shards)
    pub fn key_attribute(&self) -> &str {
        &self.key_attribute
    }

    /// Source attribute of the indexed values (of the key for reverse shards)
    pub fn value_attribute(&self) -> &str {
        &self.value_attribute
    }

    /// Filter selecting the objects this shard indexes
    pub fn ldap_filter(&self) -> &str {
        &self.ldap_filter
    }

    pub fn is_single_value(&self) -> bool {
        self.single_value
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Check that every name is usable
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("db_name", &self.db_name),
            ("key", &self.key_attribute),
            ("value", &self.value_attribute),
            ("ldap_filter", &self.ldap_filter),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidDefinition(format!(
                    "field '{}' must not be empty",
                    field
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for ShardDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (from, to) = if self.reverse {
            (&self.value_attribute, &self.key_attribute)
        } else {
            (&self.key_attribute, &self.value_attribute)
        };
        write!(f, "{}: {} -> {}", self.db_name, from, to)?;
        if self.single_value {
            write!(f, " (single)")?;
        }
        if self.reverse {
            write!(f, " (reverse)")?;
        }
        write!(f, " {}", self.ldap_filter)
    }
}

#[derive(Deserialize)]
struct RawDefinition {
    db_name: String,
    #[serde(default = "default_key")]
    key: String,
    ldap_filter: String,
    #[serde(default)]
    reverse: bool,
    #[serde(default)]
    single_value: bool,
    value: String,
}

fn default_key() -> String {
    ENTRY_DN.to_string()
}

impl TryFrom<RawDefinition> for ShardDefinition {
    type Error = Error;

    fn try_from(raw: RawDefinition) -> Result<Self> {
        let def = Self {
            db_name: raw.db_name,
            key_attribute: raw.key,
            ldap_filter: raw.ldap_filter,
            reverse: raw.reverse,
            // A reverse index fans in many keys per value
            single_value: raw.single_value && !raw.reverse,
            value_attribute: raw.value,
        };
        def.validate()?;
        Ok(def)
    }
}

// =============================================================================
// Tests
// =============================================================================

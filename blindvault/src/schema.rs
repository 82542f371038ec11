//! Field registry describing which record fields are encrypted and indexed.
//!
//! Records are loose maps of field name to value. The registry is the single
//! source of truth for which of those fields hold ciphertext (and therefore
//! must be re-encrypted during rotation) and which also carry a blind index.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reference to one field of one entity type.
///
/// # Example
///
/// ```
/// use blindvault::schema::FieldRef;
///
/// let field = FieldRef::new("client", "email");
/// assert_eq!(field.to_string(), "client.email");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    entity_type: String,
    field_name: String,
}

impl FieldRef {
    /// Creates a new field reference.
    #[must_use]
    pub fn new(entity_type: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self { entity_type: entity_type.into(), field_name: field_name.into() }
    }

    /// Returns the entity type.
    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Returns the field name.
    #[must_use]
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// Returns the name under which this field's tokens are stored in the
    /// blind index.
    #[must_use]
    pub fn index_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity_type, self.field_name)
    }
}

/// How a registered field is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldPolicy {
    /// Value is stored as AEAD ciphertext.
    pub encrypted: bool,
    /// Value's edge n-grams are written to the blind index.
    pub indexed: bool,
}

impl FieldPolicy {
    /// Encrypted, not searchable.
    pub const ENCRYPTED: Self = Self { encrypted: true, indexed: false };
    /// Encrypted and searchable by prefix.
    pub const SEARCHABLE: Self = Self { encrypted: true, indexed: true };
    /// Stored as plaintext.
    pub const PLAIN: Self = Self { encrypted: false, indexed: false };
}

/// One `[[fields]]` entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub entity_type: String,
    pub field_name: String,
    #[serde(default = "default_encrypted")]
    pub encrypted: bool,
    #[serde(default)]
    pub indexed: bool,
}

const fn default_encrypted() -> bool {
    true
}

/// Registry of `(entity_type, field_name) -> FieldPolicy`.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    fields: BTreeMap<FieldRef, FieldPolicy>,
}

impl FieldRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an entry is invalid or declared twice.
    pub fn from_specs(specs: &[FieldSpec]) -> Result<Self, Error> {
        let mut registry = Self::new();
        for spec in specs {
            let field = FieldRef::new(&spec.entity_type, &spec.field_name);
            if registry.fields.contains_key(&field) {
                return Err(Error::Config(format!("field {field} declared more than once")));
            }
            registry.register(
                field,
                FieldPolicy { encrypted: spec.encrypted, indexed: spec.indexed },
            )?;
        }
        Ok(registry)
    }

    /// Registers (or replaces) a field's policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the names are empty or contain `.`, or if
    /// the field is indexed but not encrypted (a plaintext field has no use
    /// for a blind index).
    pub fn register(&mut self, field: FieldRef, policy: FieldPolicy) -> Result<(), Error> {
        for name in [field.entity_type(), field.field_name()] {
            if name.is_empty() || name.contains('.') {
                return Err(Error::Config(format!("invalid field name component {name:?}")));
            }
        }
        if policy.indexed && !policy.encrypted {
            return Err(Error::Config(format!("field {field} is indexed but not encrypted")));
        }
        self.fields.insert(field, policy);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    ///
    /// # Errors
    ///
    /// See [`register`](Self::register).
    pub fn with_field(
        mut self,
        entity_type: &str,
        field_name: &str,
        policy: FieldPolicy,
    ) -> Result<Self, Error> {
        self.register(FieldRef::new(entity_type, field_name), policy)?;
        Ok(self)
    }

    /// Returns the policy for a field, if registered.
    #[must_use]
    pub fn policy(&self, entity_type: &str, field_name: &str) -> Option<FieldPolicy> {
        self.fields.get(&FieldRef::new(entity_type, field_name)).copied()
    }

    /// Returns the registered fields of `entity_type` with their policies.
    pub fn fields_of<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = (&'a FieldRef, FieldPolicy)> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.entity_type() == entity_type)
            .map(|(field, policy)| (field, *policy))
    }

    /// Returns the encrypted fields of `entity_type`.
    pub fn encrypted_fields<'a>(
        &'a self,
        entity_type: &'a str,
    ) -> impl Iterator<Item = (&'a FieldRef, FieldPolicy)> + 'a {
        self.fields_of(entity_type).filter(|(_, policy)| policy.encrypted)
    }

    /// Returns true if no fields are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of registered fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

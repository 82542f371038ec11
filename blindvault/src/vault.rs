//! Record vault: the write, read and search paths over encrypted records.
//!
//! The vault ties the schema registry, the active key pair and a store
//! together. Writes encrypt every encrypted field and rebuild the record's
//! blind index; reads decrypt field by field, substituting a placeholder for
//! fields that fail to authenticate; searches resolve prefix queries through
//! the blind index alone and decrypt only the matching records.

use crate::blind_index::{query_tokens, tokenize};
use crate::cipher::{decrypt_string, encrypt_str};
use crate::error::{DecryptError, Error};
use crate::keys::{ActiveKeys, KeyMaterial};
use crate::schema::{FieldRef, FieldRegistry};
use crate::store::{EncryptedRecord, RecordId, RotationStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Text shown in place of a field that could not be decrypted.
pub const DECRYPTION_ERROR_PLACEHOLDER: &str = "[decryption error]";

/// A field value as returned by the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Decrypted (or plaintext) value.
    Text(String),
    /// Value present but unreadable under the active key.
    Unreadable(DecryptError),
}

impl FieldValue {
    /// Returns the value, or [`DECRYPTION_ERROR_PLACEHOLDER`] if unreadable.
    #[must_use]
    pub fn display_text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Unreadable(_) => DECRYPTION_ERROR_PLACEHOLDER,
        }
    }

    /// Returns the value if it was readable.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Unreadable(_) => None,
        }
    }
}

/// A record with its fields decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedRecord {
    pub id: RecordId,
    pub entity_type: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl DecryptedRecord {
    /// Returns the readable text of `field`, if present and readable.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_text)
    }
}

/// Encrypting front end over a record and index store.
///
/// # Example
///
/// ```
/// use blindvault::prelude::*;
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = FieldRegistry::new().with_field("client", "name", FieldPolicy::SEARCHABLE)?;
/// let keys = ActiveKeys::new(KeyMaterial::generate());
/// let vault = RecordVault::new(Arc::new(InMemoryStore::new()), registry, keys);
///
/// let fields = BTreeMap::from([("name".to_string(), "Acme Holdings".to_string())]);
/// vault.write_record(1, "client", &fields)?;
///
/// let hits = vault.search("client", "name", "acm", 10)?;
/// assert_eq!(hits[0].text("name"), Some("Acme Holdings"));
/// # Ok(())
/// # }
/// ```
pub struct RecordVault<S> {
    store: Arc<S>,
    registry: Arc<FieldRegistry>,
    keys: ActiveKeys,
}

impl<S> Clone for RecordVault<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            keys: self.keys.clone(),
        }
    }
}

impl<S: RotationStore> RecordVault<S> {
    /// Creates a vault over `store`.
    pub fn new(store: Arc<S>, registry: FieldRegistry, keys: ActiveKeys) -> Self {
        Self { store, registry: Arc::new(registry), keys }
    }

    /// Returns the active key handle.
    #[must_use]
    pub const fn keys(&self) -> &ActiveKeys {
        &self.keys
    }

    /// Returns the schema registry.
    #[must_use]
    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Creates or fully replaces a record from plaintext fields.
    ///
    /// Encrypted fields are sealed under the active key; indexed fields have
    /// their tokens rebuilt, and index rows of fields no longer present are
    /// removed. The record and its index rows are replaced in one store
    /// operation, so a failed write leaves the previous version searchable.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownField` if a field is not registered for `entity_type`
    /// - `Error::EncryptionFailed` / `Error::IndexGenerationFailed` on crypto failure
    /// - `Error::Store` if the store fails
    pub fn write_record(
        &self,
        id: RecordId,
        entity_type: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let keys = self.keys.current();
        let mut record = EncryptedRecord::new(id, entity_type);
        let mut index = BTreeMap::new();

        for (name, value) in fields {
            let policy =
                self.registry.policy(entity_type, name).ok_or_else(|| Error::UnknownField {
                    entity_type: entity_type.to_string(),
                    field_name: name.clone(),
                })?;

            let stored = if policy.encrypted { encrypt_str(value, &keys)? } else { value.clone() };
            record.fields.insert(name.clone(), stored);

            if policy.indexed {
                let field = FieldRef::new(entity_type, name.as_str());
                index.insert(field.index_name(), tokenize(value, &keys)?);
            }
        }

        self.store.replace_record(&record, &index)?;

        debug!(id, entity_type, fields = record.fields.len(), "record written");
        Ok(())
    }

    /// Reads and decrypts a record.
    ///
    /// Fields that fail to decrypt come back as [`FieldValue::Unreadable`]
    /// rather than failing the whole read. Unregistered fields are returned
    /// as stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the store fails.
    pub fn read_record(&self, id: RecordId) -> Result<Option<DecryptedRecord>, Error> {
        let keys = self.keys.current();
        Ok(self.store.get_record(id)?.map(|record| self.decrypt_record(record, &keys)))
    }

    /// Finds records of `entity_type` whose `field` has, for every word of
    /// `query`, a word starting with it.
    ///
    /// Matching uses only blind-index tokens; the matching records are then
    /// fetched and decrypted. Results are in ascending id order, at most
    /// `limit` of them. An empty query matches nothing.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownField` if the field is not registered
    /// - `Error::FieldNotIndexed` if the field has no blind index
    /// - `Error::Store` if the store fails
    pub fn search(
        &self,
        entity_type: &str,
        field: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<DecryptedRecord>, Error> {
        let policy = self.registry.policy(entity_type, field).ok_or_else(|| {
            Error::UnknownField { entity_type: entity_type.to_string(), field_name: field.to_string() }
        })?;
        let field_ref = FieldRef::new(entity_type, field);
        if !policy.indexed {
            return Err(Error::FieldNotIndexed(field_ref.to_string()));
        }

        let keys = self.keys.current();
        let tokens = query_tokens(query, &keys)?;
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        // A single word can be capped at the store; multi-word queries need
        // full candidate sets to intersect.
        let candidate_limit = if tokens.len() == 1 { limit } else { usize::MAX };
        let index_name = field_ref.index_name();

        let mut candidates: Option<BTreeSet<RecordId>> = None;
        for token in &tokens {
            let ids: BTreeSet<_> =
                self.store.query_by_token(token, &index_name, candidate_limit)?.into_iter().collect();
            candidates = Some(match candidates {
                None => ids,
                Some(previous) => previous.intersection(&ids).copied().collect(),
            });
            if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }

        let mut results = Vec::new();
        for id in candidates.unwrap_or_default().into_iter().take(limit) {
            match self.store.get_record(id)? {
                Some(record) if record.entity_type == entity_type => {
                    results.push(self.decrypt_record(record, &keys));
                }
                Some(_) => {}
                None => warn!(id, index = %index_name, "blind index references a missing record"),
            }
        }
        Ok(results)
    }

    /// Deletes a record and all of its index rows.
    ///
    /// # Errors
    ///
    /// Returns `Error::Store` if the store fails.
    pub fn delete_record(&self, id: RecordId) -> Result<bool, Error> {
        Ok(self.store.delete_record(id)?)
    }

    fn decrypt_record(&self, record: EncryptedRecord, keys: &KeyMaterial) -> DecryptedRecord {
        let fields = record
            .fields
            .into_iter()
            .map(|(name, stored)| {
                let encrypted = self
                    .registry
                    .policy(&record.entity_type, &name)
                    .is_some_and(|policy| policy.encrypted);
                let value = if encrypted {
                    match decrypt_string(&stored, keys) {
                        Ok(text) => FieldValue::Text(text),
                        Err(err) => {
                            warn!(id = record.id, field = %name, error = %err, "field unreadable");
                            FieldValue::Unreadable(err)
                        }
                    }
                } else {
                    FieldValue::Text(stored)
                };
                (name, value)
            })
            .collect();

        DecryptedRecord { id: record.id, entity_type: record.entity_type, fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::schema::FieldPolicy;
    use crate::store::RecordStore;

    fn registry() -> FieldRegistry {
        FieldRegistry::new()
            .with_field("client", "name", FieldPolicy::SEARCHABLE)
            .unwrap()
            .with_field("client", "email", FieldPolicy::SEARCHABLE)
            .unwrap()
            .with_field("client", "address", FieldPolicy::ENCRYPTED)
            .unwrap()
            .with_field("client", "status", FieldPolicy::PLAIN)
            .unwrap()
            .with_field("enquiry", "name", FieldPolicy::SEARCHABLE)
            .unwrap()
    }

    fn vault() -> RecordVault<InMemoryStore> {
        RecordVault::new(
            Arc::new(InMemoryStore::new()),
            registry(),
            ActiveKeys::new(KeyMaterial::generate()),
        )
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_write_read_round_trip() {
        let vault = vault();
        let input = fields(&[
            ("name", "Acme Holdings"),
            ("address", "1 Main St"),
            ("status", "active"),
        ]);

        vault.write_record(1, "client", &input).unwrap();
        let record = vault.read_record(1).unwrap().unwrap();

        assert_eq!(record.text("name"), Some("Acme Holdings"));
        assert_eq!(record.text("address"), Some("1 Main St"));
        assert_eq!(record.text("status"), Some("active"));
    }

    #[test]
    fn test_encrypted_fields_not_stored_in_plaintext() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme"), ("status", "active")])).unwrap();

        let stored = vault.store().get_record(1).unwrap().unwrap();
        assert_ne!(stored.fields["name"], "Acme");
        assert_eq!(stored.fields["status"], "active");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let vault = vault();
        let result = vault.write_record(1, "client", &fields(&[("ssn", "123")]));
        assert!(matches!(result, Err(Error::UnknownField { .. })));
    }

    #[test]
    fn test_read_missing_record() {
        assert!(vault().read_record(404).unwrap().is_none());
    }

    #[test]
    fn test_search_prefix_match() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme Holdings")])).unwrap();
        vault.write_record(2, "client", &fields(&[("name", "Beta Industries")])).unwrap();
        vault.write_record(3, "client", &fields(&[("name", "acme labs")])).unwrap();

        let ids: Vec<_> =
            vault.search("client", "name", "ACM", 10).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);

        let ids: Vec<_> =
            vault.search("client", "name", "Acme", 10).unwrap().iter().map(|r| r.id).collect();
        assert!(!ids.contains(&2));
    }

    #[test]
    fn test_search_multi_word_intersects() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme Holdings")])).unwrap();
        vault.write_record(2, "client", &fields(&[("name", "Acme Labs")])).unwrap();

        let hits = vault.search("client", "name", "acme hol", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn test_search_is_field_scoped() {
        let vault = vault();
        vault
            .write_record(1, "client", &fields(&[("name", "Zed"), ("email", "acme@example.com")]))
            .unwrap();
        vault.write_record(2, "enquiry", &fields(&[("name", "Acme")])).unwrap();

        assert!(vault.search("client", "name", "acme", 10).unwrap().is_empty());
        assert_eq!(vault.search("client", "email", "acme", 10).unwrap()[0].id, 1);
        assert_eq!(vault.search("enquiry", "name", "acme", 10).unwrap()[0].id, 2);
    }

    #[test]
    fn test_search_respects_limit_and_empty_query() {
        let vault = vault();
        for id in 1..=5 {
            vault.write_record(id, "client", &fields(&[("name", "Acme")])).unwrap();
        }

        assert_eq!(vault.search("client", "name", "acme", 2).unwrap().len(), 2);
        assert!(vault.search("client", "name", "   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_search_requires_indexed_field() {
        let vault = vault();
        assert!(matches!(
            vault.search("client", "address", "main", 10),
            Err(Error::FieldNotIndexed(_))
        ));
        assert!(matches!(
            vault.search("client", "phone", "555", 10),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn test_update_removes_stale_tokens() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme")])).unwrap();
        vault.write_record(1, "client", &fields(&[("name", "Beta")])).unwrap();

        assert!(vault.search("client", "name", "acme", 10).unwrap().is_empty());
        assert_eq!(vault.search("client", "name", "beta", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_unreadable_field_gets_placeholder() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme"), ("status", "active")])).unwrap();

        vault.keys().replace(KeyMaterial::generate());
        let record = vault.read_record(1).unwrap().unwrap();

        assert_eq!(record.fields["name"], FieldValue::Unreadable(DecryptError::Authentication));
        assert_eq!(record.fields["name"].display_text(), DECRYPTION_ERROR_PLACEHOLDER);
        assert_eq!(record.text("status"), Some("active"));
    }

    #[test]
    fn test_delete_record_clears_index() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme")])).unwrap();

        assert!(vault.delete_record(1).unwrap());
        assert!(vault.search("client", "name", "acme", 10).unwrap().is_empty());
        assert_eq!(vault.store().index_len(), 0);
        assert!(!vault.delete_record(1).unwrap());
    }

    #[test]
    fn test_failed_write_keeps_previous_version_searchable() {
        let vault = vault();
        vault.write_record(1, "client", &fields(&[("name", "Acme")])).unwrap();
        let rows = vault.store().index_len();

        vault.store().fail_commits_touching(1, 1);
        let result = vault.write_record(1, "client", &fields(&[("name", "Globex")]));

        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(vault.read_record(1).unwrap().unwrap().text("name"), Some("Acme"));
        assert_eq!(vault.search("client", "name", "acm", 10).unwrap()[0].id, 1);
        assert!(vault.search("client", "name", "glo", 10).unwrap().is_empty());
        assert_eq!(vault.store().index_len(), rows);
    }
}

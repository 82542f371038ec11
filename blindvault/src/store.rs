//! Storage abstractions for encrypted records and the blind index.
//!
//! The engine never talks to a database directly. Backends implement
//! [`RecordStore`] and [`IndexStore`], and [`RotationStore`] for the
//! all-or-nothing batch commit the rotation pipeline relies on.

use crate::blind_index::Token;
use crate::error::StoreError;
use std::collections::BTreeMap;

/// Identifier of a stored record. Ordering by id is stable and total.
pub type RecordId = i64;

/// A record as persisted: ciphertext (or plain, per registry) per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRecord {
    pub id: RecordId,
    pub entity_type: String,
    pub fields: BTreeMap<String, String>,
}

impl EncryptedRecord {
    /// Creates a record with no fields.
    #[must_use]
    pub fn new(id: RecordId, entity_type: impl Into<String>) -> Self {
        Self { id, entity_type: entity_type.into(), fields: BTreeMap::new() }
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Replacement data for one record inside a rotation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRewrite {
    pub id: RecordId,
    /// New stored values; fields not listed keep their current value.
    pub fields: BTreeMap<String, String>,
    /// Complete new index for the record, keyed by index name. All existing
    /// index rows of the record are removed before these are inserted.
    pub index: BTreeMap<String, Vec<Token>>,
    /// Stored field values the rewrite was computed from. When set, the
    /// rewrite only applies if the record still holds exactly these values.
    pub expected: Option<BTreeMap<String, String>>,
}

impl RecordRewrite {
    /// Creates an empty, unconditional rewrite for `id`.
    #[must_use]
    pub fn new(id: RecordId) -> Self {
        Self { id, fields: BTreeMap::new(), index: BTreeMap::new(), expected: None }
    }

    /// Creates an empty rewrite of `record` that only applies while the
    /// stored record is unchanged.
    #[must_use]
    pub fn from_scan(record: &EncryptedRecord) -> Self {
        Self { expected: Some(record.fields.clone()), ..Self::new(record.id) }
    }

    /// Returns true if `current` is what this rewrite was computed from.
    #[must_use]
    pub fn matches(&self, current: &BTreeMap<String, String>) -> bool {
        self.expected.as_ref().map_or(true, |expected| expected == current)
    }
}

/// Persistence of encrypted records.
pub trait RecordStore: Send + Sync {
    /// Counts records with id strictly greater than `after` (all if `None`).
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn count_records(&self, after: Option<RecordId>) -> Result<u64, StoreError>;

    /// Returns up to `limit` records with id strictly greater than `after`,
    /// in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn scan_batch(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError>;

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn get_record(&self, id: RecordId) -> Result<Option<EncryptedRecord>, StoreError>;

    /// Inserts a record or replaces it entirely.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn put_record(&self, record: &EncryptedRecord) -> Result<(), StoreError>;

    /// Deletes a record and every index row of it, returning whether the
    /// record existed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError>;
}

/// Persistence of `(entity_id, field_name, token)` rows.
pub trait IndexStore: Send + Sync {
    /// Replaces every token of `entity_id`'s `field_name` with `tokens`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn upsert_tokens(
        &self,
        entity_id: RecordId,
        field_name: &str,
        tokens: &[Token],
    ) -> Result<(), StoreError>;

    /// Returns up to `limit` entity ids (ascending) holding `token` in
    /// `field_name`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn query_by_token(
        &self,
        token: &Token,
        field_name: &str,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Removes every index row of `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn delete_all_for_entity(&self, entity_id: RecordId) -> Result<(), StoreError>;
}

/// A store that can write a record together with its index rows atomically.
pub trait RotationStore: RecordStore + IndexStore {
    /// Stores `record` and replaces all of its index rows with `index`
    /// (keyed by index name) in one step.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the write failed; the previous record and
    /// index rows are then left as they were.
    fn replace_record(
        &self,
        record: &EncryptedRecord,
        index: &BTreeMap<String, Vec<Token>>,
    ) -> Result<(), StoreError>;

    /// Applies a batch of rewrites as one transaction.
    ///
    /// For each rewrite: updates the listed field values, deletes all index
    /// rows of the record, and inserts the rewrite's index rows. A rewrite
    /// whose record is gone, or no longer holds [`RecordRewrite::expected`],
    /// is skipped and its id returned; the other rewrites still apply.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Transaction` (or another variant) if the batch
    /// could not be committed; in that case the store is unchanged.
    fn commit_batch(&self, rewrites: &[RecordRewrite]) -> Result<Vec<RecordId>, StoreError>;
}

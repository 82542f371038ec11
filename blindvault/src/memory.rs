//! In-memory implementations of the store and key collaborators.
//!
//! Useful for tests and embedding. [`InMemoryStore`] can be told to fail
//! commits that touch a given record, to exercise batch rollback.

use crate::blind_index::Token;
use crate::error::{KeyStoreError, StoreError};
use crate::key_store::{Checkpoint, KeyConfigStore, RotationCheckpoint};
use crate::keys::KeyMaterial;
use crate::store::{
    EncryptedRecord, IndexStore, RecordId, RecordRewrite, RecordStore, RotationStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct Tables {
    records: BTreeMap<RecordId, EncryptedRecord>,
    // (field_name, token) -> entity ids
    index: BTreeMap<(String, Token), BTreeSet<RecordId>>,
    // entity id -> its (field_name, token) rows
    rows_by_entity: HashMap<RecordId, BTreeSet<(String, Token)>>,
}

impl Tables {
    fn remove_entity_tokens(&mut self, entity_id: RecordId, field_name: Option<&str>) {
        let Some(rows) = self.rows_by_entity.get_mut(&entity_id) else {
            return;
        };
        let removed: Vec<(String, Token)> = rows
            .iter()
            .filter(|(field, _)| field_name.map_or(true, |name| name == field.as_str()))
            .cloned()
            .collect();
        for key in &removed {
            rows.remove(key);
            if let Some(ids) = self.index.get_mut(key) {
                ids.remove(&entity_id);
                if ids.is_empty() {
                    self.index.remove(key);
                }
            }
        }
        if rows.is_empty() {
            self.rows_by_entity.remove(&entity_id);
        }
    }

    fn insert_tokens(&mut self, entity_id: RecordId, field_name: &str, tokens: &[Token]) {
        let rows = self.rows_by_entity.entry(entity_id).or_default();
        for token in tokens {
            let key = (field_name.to_string(), token.clone());
            self.index.entry(key.clone()).or_default().insert(entity_id);
            rows.insert(key);
        }
    }

    fn replace_index(&mut self, entity_id: RecordId, index: &BTreeMap<String, Vec<Token>>) {
        self.remove_entity_tokens(entity_id, None);
        for (field_name, tokens) in index {
            self.insert_tokens(entity_id, field_name, tokens);
        }
    }

    fn after(&self, after: Option<RecordId>) -> impl Iterator<Item = &EncryptedRecord> {
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        self.records.range((lower, Bound::Unbounded)).map(|(_, record)| record)
    }
}

/// Record and blind index store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    // record id -> remaining commits to fail
    poisoned: Mutex<HashMap<RecordId, usize>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` batch commits or record replacements that
    /// include `record_id` fail.
    pub fn fail_commits_touching(&self, record_id: RecordId, times: usize) {
        self.poisoned.lock().insert(record_id, times);
    }

    /// Returns every `(field_name, token)` row of `entity_id`.
    #[must_use]
    pub fn tokens_for(&self, entity_id: RecordId) -> Vec<(String, Token)> {
        self.tables
            .read()
            .rows_by_entity
            .get(&entity_id)
            .map(|rows| rows.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of index rows.
    #[must_use]
    pub fn index_len(&self) -> usize {
        self.tables.read().index.values().map(BTreeSet::len).sum()
    }

    fn take_poison(&self, record_id: RecordId) -> bool {
        let mut poisoned = self.poisoned.lock();
        match poisoned.get_mut(&record_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn injected_failure(record_id: RecordId) -> StoreError {
        StoreError::Transaction(format!("injected failure while writing record {record_id}"))
    }
}

impl RecordStore for InMemoryStore {
    fn count_records(&self, after: Option<RecordId>) -> Result<u64, StoreError> {
        Ok(self.tables.read().after(after).count() as u64)
    }

    fn scan_batch(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        Ok(self.tables.read().after(after).take(limit).cloned().collect())
    }

    fn get_record(&self, id: RecordId) -> Result<Option<EncryptedRecord>, StoreError> {
        Ok(self.tables.read().records.get(&id).cloned())
    }

    fn put_record(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        self.tables.write().records.insert(record.id, record.clone());
        Ok(())
    }

    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        tables.remove_entity_tokens(id, None);
        Ok(tables.records.remove(&id).is_some())
    }
}

impl IndexStore for InMemoryStore {
    fn upsert_tokens(
        &self,
        entity_id: RecordId,
        field_name: &str,
        tokens: &[Token],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        tables.remove_entity_tokens(entity_id, Some(field_name));
        tables.insert_tokens(entity_id, field_name, tokens);
        Ok(())
    }

    fn query_by_token(
        &self,
        token: &Token,
        field_name: &str,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .index
            .get(&(field_name.to_string(), token.clone()))
            .map(|ids| ids.iter().copied().take(limit).collect())
            .unwrap_or_default())
    }

    fn delete_all_for_entity(&self, entity_id: RecordId) -> Result<(), StoreError> {
        self.tables.write().remove_entity_tokens(entity_id, None);
        Ok(())
    }
}

impl RotationStore for InMemoryStore {
    fn replace_record(
        &self,
        record: &EncryptedRecord,
        index: &BTreeMap<String, Vec<Token>>,
    ) -> Result<(), StoreError> {
        if self.take_poison(record.id) {
            return Err(Self::injected_failure(record.id));
        }
        let mut tables = self.tables.write();
        tables.records.insert(record.id, record.clone());
        tables.replace_index(record.id, index);
        Ok(())
    }

    fn commit_batch(&self, rewrites: &[RecordRewrite]) -> Result<Vec<RecordId>, StoreError> {
        let mut tables = self.tables.write();
        // Every check happens before the first change, so an error leaves the tables untouched.
        if let Some(rewrite) = rewrites.iter().find(|rewrite| self.take_poison(rewrite.id)) {
            return Err(Self::injected_failure(rewrite.id));
        }

        let mut skipped = Vec::new();
        for rewrite in rewrites {
            let Some(record) = tables.records.get_mut(&rewrite.id) else {
                skipped.push(rewrite.id);
                continue;
            };
            if !rewrite.matches(&record.fields) {
                skipped.push(rewrite.id);
                continue;
            }
            for (name, value) in &rewrite.fields {
                record.fields.insert(name.clone(), value.clone());
            }
            tables.replace_index(rewrite.id, &rewrite.index);
        }
        Ok(skipped)
    }
}

/// Key configuration kept in memory, with an in-memory backup history.
#[derive(Debug)]
pub struct MemoryKeyStore {
    current: Mutex<KeyMaterial>,
    backups: Mutex<Vec<KeyMaterial>>,
    fail_writes: AtomicBool,
}

impl MemoryKeyStore {
    /// Creates a store holding `keys`.
    #[must_use]
    pub fn new(keys: KeyMaterial) -> Self {
        Self {
            current: Mutex::new(keys),
            backups: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes subsequent `backup` and `store` calls fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fingerprints of backed-up key pairs, oldest first.
    #[must_use]
    pub fn backup_fingerprints(&self) -> Vec<String> {
        self.backups.lock().iter().map(KeyMaterial::fingerprint).collect()
    }

    fn check_writable(&self) -> Result<(), KeyStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeyStoreError::WriteFailed("configuration store is read-only".to_string()));
        }
        Ok(())
    }
}

impl KeyConfigStore for MemoryKeyStore {
    fn load(&self) -> Result<KeyMaterial, KeyStoreError> {
        Ok(self.current.lock().clone())
    }

    fn backup(&self) -> Result<String, KeyStoreError> {
        self.check_writable()?;
        let mut backups = self.backups.lock();
        backups.push(self.current.lock().clone());
        Ok(format!("memory-backup-{}", backups.len()))
    }

    fn store(&self, keys: &KeyMaterial) -> Result<(), KeyStoreError> {
        self.check_writable()?;
        *self.current.lock() = keys.clone();
        Ok(())
    }
}

/// Rotation checkpoint kept in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    slot: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpoint {
    /// Creates an empty checkpoint slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RotationCheckpoint for MemoryCheckpoint {
    fn load(&self) -> Result<Option<Checkpoint>, KeyStoreError> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), KeyStoreError> {
        *self.slot.lock() = Some(checkpoint.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), KeyStoreError> {
        *self.slot.lock() = None;
        Ok(())
    }
}

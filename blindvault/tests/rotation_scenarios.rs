//! Key rotation over a few hundred records: batching, isolated field
//! failures, batch atomicity, application writes racing a batch and search
//! equivalence across keys.

use blindvault::error::StoreError;
use blindvault::prelude::*;
use blindvault::report::FailureKind;
use blindvault::store::RecordRewrite;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const RECORDS: RecordId = 250;

type CommitHook = Box<dyn FnOnce(&InMemoryStore) + Send>;

/// Store wrapper recording the size of every committed batch. A hook can
/// run against the inner store right before the next commit, standing in
/// for an application write that lands between a batch's scan and commit.
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryStore,
    committed: Mutex<Vec<usize>>,
    before_commit: Mutex<Option<CommitHook>>,
}

impl RecordStore for RecordingStore {
    fn count_records(&self, after: Option<RecordId>) -> Result<u64, StoreError> {
        self.inner.count_records(after)
    }

    fn scan_batch(
        &self,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<EncryptedRecord>, StoreError> {
        self.inner.scan_batch(after, limit)
    }

    fn get_record(&self, id: RecordId) -> Result<Option<EncryptedRecord>, StoreError> {
        self.inner.get_record(id)
    }

    fn put_record(&self, record: &EncryptedRecord) -> Result<(), StoreError> {
        self.inner.put_record(record)
    }

    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError> {
        self.inner.delete_record(id)
    }
}

impl IndexStore for RecordingStore {
    fn upsert_tokens(
        &self,
        entity_id: RecordId,
        field_name: &str,
        tokens: &[Token],
    ) -> Result<(), StoreError> {
        self.inner.upsert_tokens(entity_id, field_name, tokens)
    }

    fn query_by_token(
        &self,
        token: &Token,
        field_name: &str,
        limit: usize,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.inner.query_by_token(token, field_name, limit)
    }

    fn delete_all_for_entity(&self, entity_id: RecordId) -> Result<(), StoreError> {
        self.inner.delete_all_for_entity(entity_id)
    }
}

impl RotationStore for RecordingStore {
    fn replace_record(
        &self,
        record: &EncryptedRecord,
        index: &BTreeMap<String, Vec<Token>>,
    ) -> Result<(), StoreError> {
        self.inner.replace_record(record, index)
    }

    fn commit_batch(&self, rewrites: &[RecordRewrite]) -> Result<Vec<RecordId>, StoreError> {
        let hook = self.before_commit.lock().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        let skipped = self.inner.commit_batch(rewrites)?;
        self.committed.lock().push(rewrites.len() - skipped.len());
        Ok(skipped)
    }
}

fn registry() -> FieldRegistry {
    FieldRegistry::new()
        .with_field("client", "name", FieldPolicy::SEARCHABLE)
        .and_then(|r| r.with_field("client", "email", FieldPolicy::SEARCHABLE))
        .and_then(|r| r.with_field("client", "address", FieldPolicy::ENCRYPTED))
        .expect("valid registry")
}

const CITIES: [&str; 5] = ["Ankara", "Izmir", "Bursa", "Antalya", "Konya"];
const COMPANIES: [&str; 4] = ["Acme", "Globex", "Initech", "Umbrella"];

/// Fills a store with `RECORDS` clients under `keys`.
fn populated(keys: &KeyMaterial) -> (Arc<RecordingStore>, RecordVault<RecordingStore>) {
    let store = Arc::new(RecordingStore::default());
    let vault = RecordVault::new(Arc::clone(&store), registry(), ActiveKeys::new(keys.clone()));

    for id in 1..=RECORDS {
        let i = usize::try_from(id).unwrap();
        let fields: BTreeMap<String, String> = [
            ("name", format!("{} Holding {id}", COMPANIES[i % COMPANIES.len()])),
            ("email", format!("contact{id}@{}.test", COMPANIES[i % COMPANIES.len()].to_lowercase())),
            ("address", format!("{} Street {id}, {}", id * 3, CITIES[i % CITIES.len()])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        vault.write_record(id, "client", &fields).unwrap();
    }
    (store, vault)
}

fn hit_ids(vault: &RecordVault<RecordingStore>, field: &str, query: &str) -> Vec<RecordId> {
    vault.search("client", field, query, usize::MAX).unwrap().iter().map(|r| r.id).collect()
}

#[test]
fn test_batches_and_clean_run() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, _) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 100).unwrap();

    assert_eq!(*store.committed.lock(), vec![100, 100, 50]);
    assert_eq!(report.total, 250);
    assert_eq!(report.processed, 250);
    assert_eq!(report.errors, 0);
    assert_eq!(report.batches, 3);
    assert!(report.is_clean());
}

#[test]
fn test_single_field_failure_is_isolated() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, _) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());

    // Record #37's address was sealed under some other key.
    let mut broken = store.get_record(37).unwrap().unwrap();
    let foreign = KeyMaterial::generate();
    let unreadable = encrypt_str("1 Nowhere Lane", &foreign).unwrap();
    broken.fields.insert("address".to_string(), unreadable.clone());
    store.put_record(&broken).unwrap();

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 100).unwrap();

    assert_eq!(report.errors, 1);
    assert_eq!(report.processed, 250);
    assert_eq!(report.failed_ids(), vec![37]);
    assert_eq!(report.failures[0].field.as_deref(), Some("address"));
    assert_eq!(report.failures[0].kind, FailureKind::FieldDecrypt);

    // The failing field is left as it was; the record's other fields moved on.
    let after = store.get_record(37).unwrap().unwrap();
    assert_eq!(after.fields["address"], unreadable);
    assert_eq!(decrypt_string(&after.fields["name"], &new).unwrap(), "Globex Holding 37");

    let vault = RecordVault::new(Arc::clone(&store), registry(), ActiveKeys::new(new));
    let record = vault.read_record(37).unwrap().unwrap();
    assert_eq!(record.text("address"), None);
    assert_eq!(record.text("email"), Some("contact37@globex.test"));
}

#[test]
fn test_failed_batch_rolls_back_entirely() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, _) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());
    store.inner.fail_commits_touching(150, 1);

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 100).unwrap();

    assert_eq!(*store.committed.lock(), vec![100, 50]);
    assert_eq!(report.batches, 3);
    assert_eq!(report.processed, 150);
    assert_eq!(report.errors, 100);
    assert_eq!(report.failed_ids(), (101..=200).collect::<Vec<_>>());

    // Every record of the failed batch is still entirely under the old key,
    // both ciphertext and index rows.
    for id in [101, 150, 200] {
        let record = store.get_record(id).unwrap().unwrap();
        assert!(decrypt_string(&record.fields["name"], &old).is_ok());
        assert!(decrypt_string(&record.fields["name"], &new).is_err());
    }
    for id in [1, 100, 201, 250] {
        let record = store.get_record(id).unwrap().unwrap();
        assert!(decrypt_string(&record.fields["name"], &new).is_ok());
    }

    let old_vault = RecordVault::new(Arc::clone(&store), registry(), ActiveKeys::new(old));
    let stale_hits = hit_ids(&old_vault, "name", "holding");
    assert_eq!(stale_hits, (101..=200).collect::<Vec<_>>());
}

#[test]
fn test_search_results_identical_across_rotation() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, vault) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());

    let queries = [
        ("name", "acme"),
        ("name", "glob hold"),
        ("name", "holding 12"),
        ("email", "contact1"),
        ("email", "CONTACT2"),
        ("name", "nomatch"),
    ];
    let before: Vec<_> = queries.iter().map(|(field, q)| hit_ids(&vault, field, q)).collect();
    let index_rows_before = store.inner.index_len();

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 64).unwrap();
    assert!(report.is_clean());

    let rotated = RecordVault::new(Arc::clone(&store), registry(), ActiveKeys::new(new.clone()));
    let after: Vec<_> = queries.iter().map(|(field, q)| hit_ids(&rotated, field, q)).collect();

    assert_eq!(before, after);
    assert!(!before[0].is_empty());
    assert!(before[5].is_empty());
    assert_eq!(store.inner.index_len(), index_rows_before);

    // No token of the old key survives.
    for (_, token) in store.inner.tokens_for(42) {
        assert!(is_foreign_to(&token, &old));
    }
    assert_eq!(config.load().unwrap().fingerprint(), new.fingerprint());
}

fn is_foreign_to(token: &Token, old: &KeyMaterial) -> bool {
    ["acme", "initech", "umbrella", "globex", "contact42"]
        .iter()
        .flat_map(|word| tokenize(word, old).unwrap())
        .all(|old_token| &old_token != token)
}

#[test]
fn test_application_write_during_batch_is_kept() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, _) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());

    // The application, still on the old keys, renames client #1 after the
    // first batch was read but before it commits.
    let hook_keys = old.clone();
    *store.before_commit.lock() = Some(Box::new(move |inner: &InMemoryStore| {
        let mut record = inner.get_record(1).unwrap().unwrap();
        record.fields.insert("name".to_string(), encrypt_str("Updated Name", &hook_keys).unwrap());
        let index = BTreeMap::from([(
            "client.name".to_string(),
            tokenize("Updated Name", &hook_keys).unwrap(),
        )]);
        inner.replace_record(&record, &index).unwrap();
    }));

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 100).unwrap();

    assert!(report.is_clean());
    assert_eq!((report.total, report.processed, report.batches), (250, 250, 3));
    assert_eq!(*store.committed.lock(), vec![99, 1, 100, 50]);

    let record = store.get_record(1).unwrap().unwrap();
    assert_eq!(decrypt_string(&record.fields["name"], &new).unwrap(), "Updated Name");
    assert_eq!(decrypt_string(&record.fields["email"], &new).unwrap(), "contact1@globex.test");

    let rotated = RecordVault::new(Arc::clone(&store), registry(), ActiveKeys::new(new));
    assert_eq!(hit_ids(&rotated, "name", "updated"), vec![1]);
    assert!(!hit_ids(&rotated, "name", "globex holding 1").contains(&1));
}

#[test]
fn test_record_deleted_during_batch_is_not_resurrected() {
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let (store, _) = populated(&old);
    let config = MemoryKeyStore::new(old.clone());

    *store.before_commit.lock() = Some(Box::new(|inner: &InMemoryStore| {
        inner.delete_record(42).unwrap();
    }));

    let report = rotate(store.as_ref(), &registry(), &config, &old, &new, 100).unwrap();

    assert!(report.is_clean());
    assert_eq!(report.processed, 250);
    assert_eq!(store.get_record(42).unwrap(), None);
    assert!(store.inner.tokens_for(42).is_empty());
    assert_eq!(store.count_records(None).unwrap(), 249);
}

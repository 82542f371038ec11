//! Write, search and rotate against a SQLite database file.

use blindvault::prelude::*;
use blindvault_key_file::{read_key_file, FileCheckpoint, FileKeyStore};
use blindvault_sqlite::SqliteStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

fn registry() -> FieldRegistry {
    FieldRegistry::new()
        .with_field("client", "name", FieldPolicy::SEARCHABLE)
        .and_then(|r| r.with_field("client", "phone", FieldPolicy::ENCRYPTED))
        .and_then(|r| r.with_field("enquiry", "subject", FieldPolicy::SEARCHABLE))
        .expect("valid registry")
}

fn write(vault: &RecordVault<SqliteStore>, id: RecordId, entity: &str, pairs: &[(&str, &str)]) {
    let fields: BTreeMap<_, _> =
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
    vault.write_record(id, entity, &fields).unwrap();
}

fn ids(records: &[DecryptedRecord]) -> Vec<RecordId> {
    records.iter().map(|r| r.id).collect()
}

#[test]
fn test_search_filters_entity_type() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let vault = RecordVault::new(store, registry(), ActiveKeys::new(KeyMaterial::generate()));

    write(&vault, 1, "client", &[("name", "Acme Corporation"), ("phone", "+90 555 0101")]);
    write(&vault, 2, "enquiry", &[("subject", "Acme renewal")]);
    write(&vault, 3, "client", &[("name", "Acme Labs")]);

    assert_eq!(ids(&vault.search("client", "name", "acme", 10).unwrap()), vec![1, 3]);
    assert_eq!(ids(&vault.search("enquiry", "subject", "acme", 10).unwrap()), vec![2]);
    assert_eq!(ids(&vault.search("client", "name", "acme", 1).unwrap()), vec![1]);
    assert!(matches!(
        vault.search("client", "phone", "555", 10),
        Err(Error::FieldNotIndexed(_))
    ));

    assert_eq!(vault.read_record(1).unwrap().unwrap().text("phone"), Some("+90 555 0101"));
    assert!(vault.delete_record(3).unwrap());
    assert_eq!(ids(&vault.search("client", "name", "acme", 10).unwrap()), vec![1]);
}

#[test]
fn test_rotation_over_sqlite_file() {
    let dir = TempDir::new().unwrap();
    let key_store = FileKeyStore::init(dir.path().join("keys.toml")).unwrap();
    let old = key_store.load().unwrap();
    let new = KeyMaterial::generate();
    let registry = registry();

    let db_path = dir.path().join("vault.db");
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let active = ActiveKeys::new(old.clone());
    let vault = RecordVault::new(Arc::clone(&store), registry.clone(), active.clone());
    for id in 1..=30 {
        write(&vault, id, "client", &[("name", &format!("Client {id}")), ("phone", "555")]);
    }
    let rows_before = store.index_len().unwrap();

    let checkpoint = FileCheckpoint::new(dir.path().join("rotation.checkpoint.toml"));
    let report = RotationPipeline::new(store.as_ref(), &registry, &key_store)
        .with_options(RotationOptions { batch_size: 8, commit_retries: 0 })
        .with_checkpoint(&checkpoint)
        .with_active_keys(&active)
        .rotate(&old, &new)
        .unwrap();

    assert_eq!((report.total, report.processed, report.errors, report.batches), (30, 30, 0, 4));
    assert_eq!(read_key_file(&dir.path().join("keys.toml")).unwrap().fingerprint(), new.fingerprint());
    assert_eq!(store.index_len().unwrap(), rows_before);

    // A fresh connection with the key file from disk sees the rotated data.
    drop(vault);
    let reopened = Arc::new(SqliteStore::open(&db_path).unwrap());
    let vault = RecordVault::new(reopened, registry, ActiveKeys::new(key_store.load().unwrap()));
    assert_eq!(ids(&vault.search("client", "name", "client 2", 10).unwrap()), vec![2]);
    assert_eq!(ids(&vault.search("client", "name", "cli 3", 10).unwrap()), vec![3]);
    assert_eq!(vault.read_record(17).unwrap().unwrap().text("phone"), Some("555"));
}

#[test]
fn test_resume_from_checkpoint_over_sqlite() {
    let dir = TempDir::new().unwrap();
    let old = KeyMaterial::generate();
    let new = KeyMaterial::generate();
    let registry = registry();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let vault = RecordVault::new(Arc::clone(&store), registry.clone(), ActiveKeys::new(old.clone()));
    for id in 1..=10 {
        write(&vault, id, "client", &[("name", &format!("Client {id}"))]);
    }

    // A previous run to `new` got through record 6 before stopping.
    let checkpoint = FileCheckpoint::new(dir.path().join("rotation.checkpoint.toml"));
    checkpoint
        .save(&blindvault::key_store::Checkpoint {
            target_fingerprint: new.fingerprint(),
            last_rotated_id: 6,
            failed_ids: Vec::new(),
        })
        .unwrap();

    let config = MemoryKeyStore::new(old.clone());
    let report = RotationPipeline::new(store.as_ref(), &registry, &config)
        .with_options(RotationOptions { batch_size: 3, commit_retries: 0 })
        .with_checkpoint(&checkpoint)
        .rotate(&old, &new)
        .unwrap();

    assert_eq!(report.resumed_after, Some(6));
    assert_eq!((report.total, report.processed, report.batches), (4, 4, 2));

    // Records 1..=6 were not touched by this run.
    let untouched = store.get_record(3).unwrap().unwrap();
    assert!(decrypt_string(&untouched.fields["name"], &old).is_ok());
    let rotated = store.get_record(9).unwrap().unwrap();
    assert_eq!(decrypt_string(&rotated.fields["name"], &new).unwrap(), "Client 9");
    assert_eq!(checkpoint.load().unwrap(), None);
}

//! Basic usage example for `BlindVault`: write, search, rotate, search again.

use blindvault::prelude::*;
use blindvault_key_file::FileKeyStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("BlindVault Basic Usage Example");
    println!("==============================\n");

    // Key file on disk, created on first run.
    let key_path = PathBuf::from("./example_keys/keys.toml");
    let key_store =
        if key_path.exists() { FileKeyStore::new(&key_path)? } else { FileKeyStore::init(&key_path)? };
    let keys = ActiveKeys::new(key_store.load()?);
    println!("✓ Keys loaded, fingerprint {}\n", keys.current().fingerprint());

    // Which fields are encrypted and which are searchable.
    let registry = FieldRegistry::new()
        .with_field("client", "name", FieldPolicy::SEARCHABLE)?
        .with_field("client", "email", FieldPolicy::SEARCHABLE)?
        .with_field("client", "notes", FieldPolicy::ENCRYPTED)?;

    let store = Arc::new(InMemoryStore::new());
    let vault = RecordVault::new(Arc::clone(&store), registry.clone(), keys.clone());

    let clients = [
        (1, "Acme Corporation", "billing@acme.test", "pays late"),
        (2, "Acme Labs", "lab@acme.test", "prefers email"),
        (3, "Globex", "info@globex.test", "key account"),
    ];
    for (id, name, email, notes) in clients {
        let fields = BTreeMap::from([
            ("name".to_string(), name.to_string()),
            ("email".to_string(), email.to_string()),
            ("notes".to_string(), notes.to_string()),
        ]);
        vault.write_record(id, "client", &fields)?;
    }
    println!("✓ {} records written\n", clients.len());

    let raw = store.get_record(1)?.ok_or("record 1 missing")?;
    println!("Stored name of #1: {}", raw.fields["name"]);
    println!("Index rows: {}\n", store.index_len());

    for query in ["acm", "acme lab", "glo", "zzz"] {
        let hits = vault.search("client", "name", query, 10)?;
        let names: Vec<_> = hits.iter().filter_map(|r| r.text("name")).collect();
        println!("search name ~ {query:?}: {names:?}");
    }

    // Rotate to a fresh pair; the vault shares `keys`, so it follows the switch.
    let old = keys.current();
    let new = KeyMaterial::generate();
    let mut pipeline = RotationPipeline::new(store.as_ref(), &registry, &key_store)
        .with_options(RotationOptions { batch_size: 2, commit_retries: 1 })
        .with_notifier(&LogNotifier)
        .with_active_keys(&keys);
    let report = pipeline.rotate(&old, &new)?;
    println!("\n✓ {report}");

    let hits = vault.search("client", "email", "lab@", 10)?;
    println!("search email ~ \"lab@\" after rotation: {:?}", hits.iter().map(|r| r.id).collect::<Vec<_>>());

    Ok(())
}

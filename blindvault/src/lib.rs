//! # `BlindVault`
//!
//! Searchable field encryption for record stores, with edge n-gram blind
//! indexes and batched, resumable key rotation.
//!
//! ## Features
//!
//! - AEAD field encryption (ChaCha20-Poly1305, random nonce per value)
//! - Keyed blind-index tokens (HMAC-SHA256) over edge n-grams for prefix search
//! - Schema registry deciding which fields are encrypted and indexed
//! - Key rotation in atomic batches, with checkpoints, config backup and
//!   out-of-band notification
//!
//! ## Example
//!
//! ```rust,ignore
//! use blindvault::prelude::*;
//!
//! let keys = ActiveKeys::new(FileKeyStore::new("./keys.toml")?.load()?);
//! let vault = RecordVault::new(store, registry, keys);
//!
//! vault.write_record(1, "client", &fields)?;
//! let hits = vault.search("client", "name", "acm", 20)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blind_index;
pub mod cipher;
pub mod config;
pub mod error;
pub mod key_store;
pub mod keys;
pub mod memory;
pub mod report;
pub mod rotation;
pub mod schema;
pub mod store;
pub mod tokenizer;
pub mod vault;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::blind_index::{token, tokenize, Token};
    pub use crate::cipher::{decrypt, decrypt_string, encrypt, encrypt_str};
    pub use crate::config::{Config, RotationOptions};
    pub use crate::error::{DecryptError, Error, KeyStoreError, StoreError};
    pub use crate::key_store::{KeyConfigStore, LogNotifier, Notifier, RotationCheckpoint};
    pub use crate::keys::{ActiveKeys, KeyMaterial};
    pub use crate::memory::{InMemoryStore, MemoryCheckpoint, MemoryKeyStore};
    pub use crate::report::RotationReport;
    pub use crate::rotation::{rotate, RotationError, RotationPipeline};
    pub use crate::schema::{FieldPolicy, FieldRef, FieldRegistry};
    pub use crate::store::{EncryptedRecord, IndexStore, RecordId, RecordStore, RotationStore};
    pub use crate::tokenizer::{edge_ngrams, normalize};
    pub use crate::vault::{DecryptedRecord, FieldValue, RecordVault};
}

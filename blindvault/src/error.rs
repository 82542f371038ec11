//! Error types for `BlindVault` operations.

use std::fmt;

/// Main error type for `BlindVault` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (see [`DecryptError`] for the cause)
    #[error(transparent)]
    Decrypt(#[from] DecryptError),

    /// Key material is malformed or violates the key-pair invariants
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,

    /// Blind index generation failed
    #[error("blind index generation failed: {0}")]
    IndexGenerationFailed(String),

    /// The field is not declared in the schema registry
    #[error("unknown field: {entity_type}.{field_name}")]
    UnknownField {
        /// Entity type of the record
        entity_type: String,
        /// Field that has no registry entry
        field_name: String,
    },

    /// The field exists but carries no blind index
    #[error("field is not searchable: {0}")]
    FieldNotIndexed(String),

    /// Record or index store operation failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Key configuration store operation failed
    #[error("key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Configuration could not be parsed or is inconsistent
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a ciphertext could not be opened.
///
/// Decryption always fails closed: no partial plaintext is ever returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    /// Authentication tag did not verify (tampered, corrupted, or wrong key)
    #[error("authentication failed: ciphertext may be corrupted, tampered, or sealed under another key")]
    Authentication,

    /// Ciphertext is not valid base64 or is too short to hold a nonce and tag
    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    /// Plaintext opened correctly but is not UTF-8 text
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors reported by record and index store backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached or opened
    Unavailable(String),

    /// A query or statement failed
    Query(String),

    /// A transactional commit failed and was rolled back
    Transaction(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Query(msg) => write!(f, "query failed: {msg}"),
            Self::Transaction(msg) => write!(f, "transaction rolled back: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the external key configuration, checkpoint and notifier collaborators.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// No key configuration exists at the expected location
    #[error("key configuration not found: {0}")]
    NotFound(String),

    /// Key configuration exists but cannot be parsed
    #[error("malformed key configuration: {0}")]
    Malformed(String),

    /// Writing the configuration or its backup failed
    #[error("key configuration write failed: {0}")]
    WriteFailed(String),

    /// Out-of-band notification could not be delivered
    #[error("notification failed: {0}")]
    NotifyFailed(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

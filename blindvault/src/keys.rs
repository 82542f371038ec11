//! Key material for field encryption and blind indexing.
//!
//! A [`KeyMaterial`] value is a pair of independent 256-bit secrets: one drives
//! the AEAD cipher, the other keys the HMAC used for blind-index tokens. The
//! pair is always passed explicitly into crypto calls; [`ActiveKeys`] is the
//! shared handle an application holds for its current pair.

use crate::error::Error;
use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use hkdf::Hkdf;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, Secret, SecretVec};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Size of each key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Minimum master secret length accepted by [`KeyMaterial::derive_from_master`].
pub const MIN_MASTER_SIZE: usize = 32;

const ENCRYPTION_KEY_INFO: &[u8] = b"blindvault|encryption-key|v1";
const INDEX_KEY_INFO: &[u8] = b"blindvault|index-key|v1";

/// An encryption key and an index key, held as secrets.
///
/// The two keys are never equal. A leaked index key reveals nothing about the
/// encryption key.
pub struct KeyMaterial {
    encryption_key: Secret<[u8; KEY_SIZE]>,
    index_key: Secret<[u8; KEY_SIZE]>,
}

impl KeyMaterial {
    /// Creates key material from two raw keys.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if the keys are identical.
    pub fn new(encryption_key: [u8; KEY_SIZE], index_key: [u8; KEY_SIZE]) -> Result<Self, Error> {
        if encryption_key == index_key {
            return Err(Error::InvalidKeyMaterial(
                "encryption key and index key must differ".to_string(),
            ));
        }
        Ok(Self { encryption_key: Secret::new(encryption_key), index_key: Secret::new(index_key) })
    }

    /// Creates key material from byte slices, checking their lengths.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if either slice is not [`KEY_SIZE`]
    /// bytes long or the keys are identical.
    pub fn from_slices(encryption_key: &[u8], index_key: &[u8]) -> Result<Self, Error> {
        let encryption_key: [u8; KEY_SIZE] = encryption_key.try_into().map_err(|_| {
            Error::InvalidKeyMaterial(format!(
                "encryption key must be {KEY_SIZE} bytes, got {}",
                encryption_key.len()
            ))
        })?;
        let index_key: [u8; KEY_SIZE] = index_key.try_into().map_err(|_| {
            Error::InvalidKeyMaterial(format!(
                "index key must be {KEY_SIZE} bytes, got {}",
                index_key.len()
            ))
        })?;
        Self::new(encryption_key, index_key)
    }

    /// Generates a fresh random key pair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; KEY_SIZE];
        let mut index_key = [0u8; KEY_SIZE];
        loop {
            OsRng.fill_bytes(&mut encryption_key);
            OsRng.fill_bytes(&mut index_key);
            if encryption_key != index_key {
                break;
            }
        }
        Self { encryption_key: Secret::new(encryption_key), index_key: Secret::new(index_key) }
    }

    /// Derives both keys from a single master secret using HKDF-SHA256.
    ///
    /// Each key is expanded with its own `info` label, so neither key can be
    /// computed from the other without the master secret.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyMaterial` if the master secret is shorter than
    /// [`MIN_MASTER_SIZE`], or `Error::KeyDerivation` if expansion fails.
    ///
    /// # Example
    ///
    /// ```
    /// use blindvault::keys::KeyMaterial;
    /// use secrecy::SecretVec;
    ///
    /// let master = SecretVec::new(vec![7u8; 32]);
    /// let keys = KeyMaterial::derive_from_master(&master).expect("derivation failed");
    /// assert_eq!(keys.fingerprint().len(), 16);
    /// ```
    pub fn derive_from_master(master: &SecretVec<u8>) -> Result<Self, Error> {
        let ikm = master.expose_secret();
        if ikm.len() < MIN_MASTER_SIZE {
            return Err(Error::InvalidKeyMaterial(format!(
                "master secret must be at least {MIN_MASTER_SIZE} bytes, got {}",
                ikm.len()
            )));
        }

        let hkdf = Hkdf::<Sha256>::new(None, ikm);
        let mut encryption_key = [0u8; KEY_SIZE];
        let mut index_key = [0u8; KEY_SIZE];
        hkdf.expand(ENCRYPTION_KEY_INFO, &mut encryption_key).map_err(|_| Error::KeyDerivation)?;
        hkdf.expand(INDEX_KEY_INFO, &mut index_key).map_err(|_| Error::KeyDerivation)?;

        Self::new(encryption_key, index_key)
    }

    /// Returns the AEAD key.
    #[must_use]
    pub const fn encryption_key(&self) -> &Secret<[u8; KEY_SIZE]> {
        &self.encryption_key
    }

    /// Returns the blind-index HMAC key.
    #[must_use]
    pub const fn index_key(&self) -> &Secret<[u8; KEY_SIZE]> {
        &self.index_key
    }

    /// Returns a short, non-secret identifier for this key pair.
    ///
    /// Safe to log. Two pairs with the same fingerprint are treated as the
    /// same pair.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"blindvault|fingerprint|v1");
        hasher.update(self.encryption_key.expose_secret());
        hasher.update(self.index_key.expose_secret());
        hex::encode(&hasher.finalize()[..8])
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            encryption_key: Secret::new(*self.encryption_key.expose_secret()),
            index_key: Secret::new(*self.index_key.expose_secret()),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Shared handle to the key pair an application currently encrypts with.
///
/// Cloning the handle shares the same slot. The rotation pipeline replaces the
/// pair only after the new configuration has been durably written.
#[derive(Clone)]
pub struct ActiveKeys {
    slot: Arc<RwLock<Arc<KeyMaterial>>>,
}

impl ActiveKeys {
    /// Creates a handle holding `keys`.
    #[must_use]
    pub fn new(keys: KeyMaterial) -> Self {
        Self { slot: Arc::new(RwLock::new(Arc::new(keys))) }
    }

    /// Returns the current key pair.
    #[must_use]
    pub fn current(&self) -> Arc<KeyMaterial> {
        Arc::clone(&self.slot.read())
    }

    /// Installs a new key pair and returns the previous one.
    pub fn replace(&self, keys: KeyMaterial) -> Arc<KeyMaterial> {
        std::mem::replace(&mut *self.slot.write(), Arc::new(keys))
    }
}

impl fmt::Debug for ActiveKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveKeys").field("current", &*self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_equal_keys() {
        let result = KeyMaterial::new([1u8; KEY_SIZE], [1u8; KEY_SIZE]);
        assert!(matches!(result, Err(Error::InvalidKeyMaterial(_))));
    }

    #[test]
    fn test_from_slices_checks_length() {
        let result = KeyMaterial::from_slices(&[1u8; 16], &[2u8; KEY_SIZE]);
        assert!(matches!(result, Err(Error::InvalidKeyMaterial(_))));

        let result = KeyMaterial::from_slices(&[1u8; KEY_SIZE], &[2u8; 33]);
        assert!(matches!(result, Err(Error::InvalidKeyMaterial(_))));

        assert!(KeyMaterial::from_slices(&[1u8; KEY_SIZE], &[2u8; KEY_SIZE]).is_ok());
    }

    #[test]
    fn test_generate_produces_distinct_pairs() {
        let keys1 = KeyMaterial::generate();
        let keys2 = KeyMaterial::generate();

        assert_ne!(keys1.encryption_key().expose_secret(), keys1.index_key().expose_secret());
        assert_ne!(keys1.fingerprint(), keys2.fingerprint());
    }

    #[test]
    fn test_derive_from_master_deterministic() {
        let master = SecretVec::new(vec![9u8; 32]);

        let keys1 = KeyMaterial::derive_from_master(&master).unwrap();
        let keys2 = KeyMaterial::derive_from_master(&master).unwrap();

        assert_eq!(keys1.encryption_key().expose_secret(), keys2.encryption_key().expose_secret());
        assert_eq!(keys1.index_key().expose_secret(), keys2.index_key().expose_secret());
        assert_ne!(keys1.encryption_key().expose_secret(), keys1.index_key().expose_secret());
    }

    #[test]
    fn test_derive_from_master_different_masters() {
        let keys1 = KeyMaterial::derive_from_master(&SecretVec::new(vec![1u8; 32])).unwrap();
        let keys2 = KeyMaterial::derive_from_master(&SecretVec::new(vec![2u8; 32])).unwrap();

        assert_ne!(keys1.fingerprint(), keys2.fingerprint());
    }

    #[test]
    fn test_derive_from_master_rejects_short_master() {
        let result = KeyMaterial::derive_from_master(&SecretVec::new(vec![1u8; 16]));
        assert!(matches!(result, Err(Error::InvalidKeyMaterial(_))));
    }

    #[test]
    fn test_fingerprint_stable_across_clone() {
        let keys = KeyMaterial::generate();
        let cloned = keys.clone();

        assert_eq!(keys.fingerprint(), cloned.fingerprint());
        assert_eq!(keys.fingerprint().len(), 16);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let keys = KeyMaterial::new([0xAB; KEY_SIZE], [0xCD; KEY_SIZE]).unwrap();
        let rendered = format!("{keys:?}");

        assert!(rendered.contains(&keys.fingerprint()));
        assert!(!rendered.contains("encryption_key"));
        assert!(!rendered.contains("205, 205"));
    }

    #[test]
    fn test_active_keys_replace() {
        let old = KeyMaterial::generate();
        let new = KeyMaterial::generate();
        let old_fp = old.fingerprint();
        let new_fp = new.fingerprint();

        let active = ActiveKeys::new(old);
        let shared = active.clone();

        let previous = active.replace(new);
        assert_eq!(previous.fingerprint(), old_fp);
        assert_eq!(shared.current().fingerprint(), new_fp);
    }
}

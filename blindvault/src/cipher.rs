//! Authenticated field encryption with ChaCha20-Poly1305.
//!
//! Stored format: `base64(nonce(12) || ciphertext || tag(16))`. The nonce is
//! drawn from the OS RNG on every call and is never supplied by the caller.

use crate::error::{DecryptError, Error};
use crate::keys::KeyMaterial;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use secrecy::ExposeSecret;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_SIZE: usize = 16;

/// Encrypts `plaintext` under the encryption key of `keys`.
///
/// # Returns
///
/// Base64 text suitable for a text column.
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if the cipher rejects the input.
///
/// # Example
///
/// ```
/// use blindvault::cipher::{decrypt, encrypt};
/// use blindvault::keys::KeyMaterial;
///
/// let keys = KeyMaterial::generate();
/// let sealed = encrypt(b"alice@example.com", &keys).unwrap();
/// assert_eq!(decrypt(&sealed, &keys).unwrap(), b"alice@example.com");
/// ```
pub fn encrypt(plaintext: &[u8], keys: &KeyMaterial) -> Result<String, Error> {
    let cipher = ChaCha20Poly1305::new(keys.encryption_key().expose_secret().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::EncryptionFailed(format!("ChaCha20-Poly1305 encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

/// Decrypts a value produced by [`encrypt`].
///
/// # Errors
///
/// - `DecryptError::Malformed` if the input is not base64 or is shorter than
///   a nonce plus tag
/// - `DecryptError::Authentication` if the tag does not verify under `keys`
pub fn decrypt(ciphertext: &str, keys: &KeyMaterial) -> Result<Vec<u8>, DecryptError> {
    let bytes = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| DecryptError::Malformed(format!("invalid base64: {e}")))?;

    if bytes.len() < NONCE_SIZE + TAG_SIZE {
        return Err(DecryptError::Malformed(format!(
            "expected at least {} bytes, got {}",
            NONCE_SIZE + TAG_SIZE,
            bytes.len()
        )));
    }

    let (nonce_bytes, sealed) = bytes.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(keys.encryption_key().expose_secret().into());

    cipher.decrypt(Nonce::from_slice(nonce_bytes), sealed).map_err(|_| DecryptError::Authentication)
}

/// Encrypts a UTF-8 string.
///
/// # Errors
///
/// See [`encrypt`].
pub fn encrypt_str(plaintext: &str, keys: &KeyMaterial) -> Result<String, Error> {
    encrypt(plaintext.as_bytes(), keys)
}

/// Decrypts a value and interprets it as UTF-8 text.
///
/// # Errors
///
/// See [`decrypt`]; additionally `DecryptError::InvalidUtf8`.
pub fn decrypt_string(ciphertext: &str, keys: &KeyMaterial) -> Result<String, DecryptError> {
    let plaintext = decrypt(ciphertext, keys)?;
    String::from_utf8(plaintext).map_err(|_| DecryptError::InvalidUtf8)
}

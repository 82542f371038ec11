//! Blind index tokens for searchable encryption.
//!
//! A token is `hex(HMAC-SHA256(index_key, normalize(text))[..16])`. Tokens are
//! deterministic for a given key, so writes and queries meet on equality, and
//! they change completely when the index key changes, which is why every
//! index row must be rebuilt during key rotation.

use crate::error::Error;
use crate::keys::KeyMaterial;
use crate::tokenizer::{edge_ngrams, normalize, query_terms};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

type HmacSha256 = Hmac<Sha256>;

/// Truncated blind index size in bytes.
pub const BLIND_INDEX_SIZE: usize = 16;

/// Length of a token's hex encoding.
pub const TOKEN_LEN: usize = BLIND_INDEX_SIZE * 2;

/// A fixed-width, hex-encoded blind index token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(String);

impl Token {
    /// Returns the hex encoding.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Token {
    type Err = Error;

    /// Parses a stored token, accepting only [`TOKEN_LEN`] lowercase hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == TOKEN_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(Error::IndexGenerationFailed(format!("malformed token: {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

/// Computes the blind index token of `text`.
///
/// The text is normalized before hashing, so `"Acme"` and `" acme "` share a
/// token.
///
/// # Errors
///
/// Returns `Error::IndexGenerationFailed` if the HMAC cannot be keyed.
///
/// # Example
///
/// ```
/// use blindvault::blind_index::token;
/// use blindvault::keys::KeyMaterial;
///
/// let keys = KeyMaterial::generate();
/// assert_eq!(token("Acme", &keys).unwrap(), token(" acme ", &keys).unwrap());
/// ```
pub fn token(text: &str, keys: &KeyMaterial) -> Result<Token, Error> {
    let mut mac = HmacSha256::new_from_slice(keys.index_key().expose_secret())
        .map_err(|e| Error::IndexGenerationFailed(format!("Invalid index key: {e}")))?;

    mac.update(normalize(text).as_bytes());

    let bytes = mac.finalize().into_bytes();
    Ok(Token(hex::encode(&bytes[..BLIND_INDEX_SIZE])))
}

/// Tokenizes a field value for indexing: one token per edge n-gram.
///
/// The result is sorted and free of duplicates. An empty value yields no
/// tokens.
///
/// # Errors
///
/// Returns `Error::IndexGenerationFailed` if token computation fails.
pub fn tokenize(text: &str, keys: &KeyMaterial) -> Result<Vec<Token>, Error> {
    let mut tokens =
        edge_ngrams(text).iter().map(|gram| token(gram, keys)).collect::<Result<Vec<_>, _>>()?;
    tokens.sort();
    tokens.dedup();
    Ok(tokens)
}

/// Tokenizes a search query: one token per distinct query word.
///
/// Every query word must match an indexed prefix for a record to qualify.
///
/// # Errors
///
/// Returns `Error::IndexGenerationFailed` if token computation fails.
pub fn query_tokens(query: &str, keys: &KeyMaterial) -> Result<Vec<Token>, Error> {
    query_terms(query).iter().map(|term| token(term, keys)).collect()
}

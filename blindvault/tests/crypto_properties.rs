//! Property tests for the cipher, blind-index tokens and tokenizer.

use blindvault::blind_index::{query_tokens, token, tokenize};
use blindvault::cipher::{decrypt, decrypt_string, encrypt, encrypt_str};
use blindvault::keys::KeyMaterial;
use blindvault::tokenizer::{edge_ngrams, normalize, MIN_NGRAM_LEN};
use proptest::prelude::*;

fn key_pair() -> impl Strategy<Value = KeyMaterial> {
    (any::<[u8; 32]>(), any::<[u8; 32]>())
        .prop_filter("keys must differ", |(e, i)| e != i)
        .prop_map(|(e, i)| KeyMaterial::new(e, i).unwrap())
}

proptest! {
    #[test]
    fn prop_encrypt_decrypt_roundtrip(keys in key_pair(), data in prop::collection::vec(any::<u8>(), 0..512)) {
        let sealed = encrypt(&data, &keys).unwrap();
        prop_assert_eq!(decrypt(&sealed, &keys).unwrap(), data);
    }

    #[test]
    fn prop_text_roundtrip(keys in key_pair(), text in "\\PC{0,64}") {
        let sealed = encrypt_str(&text, &keys).unwrap();
        prop_assert_eq!(decrypt_string(&sealed, &keys).unwrap(), text);
    }

    #[test]
    fn prop_other_key_never_decrypts(a in key_pair(), b in key_pair(), text in "\\PC{1,32}") {
        prop_assume!(a.encryption_key_bytes_differ(&b));
        let sealed = encrypt_str(&text, &a).unwrap();
        prop_assert!(decrypt_string(&sealed, &b).is_err());
    }

    #[test]
    fn prop_encryption_is_randomized(keys in key_pair(), text in "\\PC{0,32}") {
        prop_assert_ne!(encrypt_str(&text, &keys).unwrap(), encrypt_str(&text, &keys).unwrap());
    }

    #[test]
    fn prop_token_deterministic_and_normalized(keys in key_pair(), word in "[a-zA-Z]{1,16}") {
        let plain = token(&word, &keys).unwrap();
        prop_assert_eq!(&plain, &token(&word, &keys).unwrap());
        prop_assert_eq!(&plain, &token(&format!("  {} ", word.to_uppercase()), &keys).unwrap());
        prop_assert_eq!(plain.as_str().len(), 32);
    }

    #[test]
    fn prop_every_prefix_is_searchable(keys in key_pair(), text in "[a-z]{2,12}( [a-z]{2,12}){0,3}") {
        let indexed = tokenize(&text, &keys).unwrap();
        for word in text.split(' ') {
            for end in MIN_NGRAM_LEN..=word.len() {
                let query = query_tokens(&word[..end], &keys).unwrap();
                prop_assert!(indexed.binary_search(&query[0]).is_ok());
            }
        }
    }

    #[test]
    fn prop_edge_ngrams_are_prefixes(text in "\\PC{0,48}") {
        let normalized = normalize(&text);
        let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();
        for gram in edge_ngrams(&text) {
            prop_assert!(words.iter().any(|w| w.starts_with(gram.as_str())));
            let chars = gram.chars().count();
            prop_assert!(chars >= MIN_NGRAM_LEN || words.contains(&gram.as_str()));
        }
        for word in &words {
            prop_assert!(edge_ngrams(&text).contains(*word));
        }
    }

    #[test]
    fn prop_normalize_is_idempotent(text in "\\PC{0,64}") {
        let once = normalize(&text);
        prop_assert_eq!(normalize(&once), once);
    }
}

trait KeyBytes {
    fn encryption_key_bytes_differ(&self, other: &Self) -> bool;
}

impl KeyBytes for KeyMaterial {
    fn encryption_key_bytes_differ(&self, other: &Self) -> bool {
        use secrecy::ExposeSecret;
        self.encryption_key().expose_secret() != other.encryption_key().expose_secret()
    }
}

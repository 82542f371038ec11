//! Text normalization and edge n-gram generation for blind indexes.
//!
//! Blind indexes only answer exact-match lookups. To support prefix search,
//! each word of a value is expanded into its left-anchored prefixes
//! ("edge n-grams") and every prefix is indexed separately. A query word is
//! then matched by looking up the single token for the whole query word.
//!
//! This leaks prefix boundaries (an observer of the index learns how many
//! prefixes a value has) but nothing else about the plaintext.

use std::collections::BTreeSet;

/// Shortest prefix emitted for words at least this long.
pub const MIN_NGRAM_LEN: usize = 2;

/// Canonicalizes text so the same logical value always yields the same string.
///
/// Lower-cases, trims, and collapses runs of whitespace to a single space.
///
/// # Example
///
/// ```
/// use blindvault::tokenizer::normalize;
///
/// assert_eq!(normalize("  Acme   Corp "), "acme corp");
/// ```
#[must_use]
pub fn normalize(text: &str) -> String {
    text.split_whitespace().map(str::to_lowercase).collect::<Vec<_>>().join(" ")
}

/// Produces the edge n-grams of `text` using [`MIN_NGRAM_LEN`].
///
/// The input is normalized first. See [`edge_ngrams_with_min`].
#[must_use]
pub fn edge_ngrams(text: &str) -> BTreeSet<String> {
    edge_ngrams_with_min(text, MIN_NGRAM_LEN)
}

/// Produces every left-anchored prefix of every word in `text`, from
/// `min_len` characters up to the whole word.
///
/// Words shorter than `min_len` are emitted whole. The result is a
/// deduplicated set; an empty or all-whitespace input yields an empty set.
/// Lengths are counted in characters, not bytes.
///
/// # Example
///
/// ```
/// use blindvault::tokenizer::edge_ngrams_with_min;
///
/// let grams: Vec<_> = edge_ngrams_with_min("Acme", 2).into_iter().collect();
/// assert_eq!(grams, vec!["ac", "acm", "acme"]);
/// ```
#[must_use]
pub fn edge_ngrams_with_min(text: &str, min_len: usize) -> BTreeSet<String> {
    let min_len = min_len.max(1);
    let mut grams = BTreeSet::new();

    for word in normalize(text).split(' ').filter(|w| !w.is_empty()) {
        let char_count = word.chars().count();
        if char_count <= min_len {
            grams.insert(word.to_string());
            continue;
        }

        // Byte offsets of every char boundary after the first `min_len - 1` chars.
        for (count, (offset, ch)) in word.char_indices().enumerate() {
            if count + 1 >= min_len {
                grams.insert(word[..offset + ch.len_utf8()].to_string());
            }
        }
    }

    grams
}

/// Splits a search query into its distinct normalized words.
///
/// Each word is later hashed whole and matched against indexed prefixes.
#[must_use]
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    normalize(query)
        .split(' ')
        .filter(|w| !w.is_empty())
        .filter(|w| seen.insert((*w).to_string()))
        .map(str::to_string)
        .collect()
}

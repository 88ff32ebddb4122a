//! Unicode-aware word tokenizer (§4.8).
//!
//! Produces a deduplicated set of 8-byte SHA-256 word hashes from event
//! content and tag values, for the full-text Word index. No file in the
//! retrieval pack implements word tokenization; this module follows the
//! Word family's own hash-then-index shape from §3 (an 8-byte hash embedded
//! in the key, no raw term stored) and reuses `sha2`, the hashing crate
//! already in the teacher's dependency table for content/id hashing.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

/// Tokenize `text` into a deduplicated set of 8-byte word hashes.
pub fn tokenize(text: &str) -> HashSet<[u8; 8]> {
    let mut hashes = HashSet::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if is_mention_start(&chars, i) {
            i = skip_to_whitespace(&chars, i);
            continue;
        }

        if is_url_like_start(&chars, i) {
            i = skip_to_whitespace(&chars, i);
            continue;
        }

        if c.is_alphanumeric() {
            let start = i;
            while i < chars.len() && chars[i].is_alphanumeric() {
                i += 1;
            }
            let word: String = chars[start..i]
                .iter()
                .flat_map(|c| c.to_lowercase())
                .collect();
            if should_keep(&word) {
                hashes.insert(hash_word(&word));
            }
            continue;
        }

        i += 1;
    }

    hashes
}

fn should_keep(word: &str) -> bool {
    if word.chars().count() < 2 {
        return false;
    }
    if is_hex_id(word) {
        return false;
    }
    true
}

fn is_hex_id(word: &str) -> bool {
    word.len() == 64 && word.chars().all(|c| c.is_ascii_hexdigit())
}

/// `#[n]` style mention: `#` followed immediately by an ASCII digit run
/// then `]`, e.g. `#[0]`.
fn is_mention_start(chars: &[char], i: usize) -> bool {
    if chars.get(i) != Some(&'#') || chars.get(i + 1) != Some(&'[') {
        return false;
    }
    let mut j = i + 2;
    let digit_start = j;
    while chars.get(j).map(|c| c.is_ascii_digit()).unwrap_or(false) {
        j += 1;
    }
    j > digit_start && chars.get(j) == Some(&']')
}

fn is_url_like_start(chars: &[char], i: usize) -> bool {
    const PREFIXES: [&str; 4] = ["http://", "https://", "nostr:", "www."];
    for prefix in PREFIXES {
        if matches_prefix(chars, i, prefix) {
            return true;
        }
    }
    // Any token containing "://" at its start: scan to the next whitespace
    // boundary and check for "://" within the leading run of non-whitespace.
    let mut j = i;
    while j < chars.len() && !chars[j].is_whitespace() && j < i + 32 {
        if matches_prefix(chars, j, "://") {
            return true;
        }
        j += 1;
    }
    false
}

fn matches_prefix(chars: &[char], i: usize, prefix: &str) -> bool {
    let prefix_chars: Vec<char> = prefix.chars().collect();
    if i + prefix_chars.len() > chars.len() {
        return false;
    }
    chars[i..i + prefix_chars.len()]
        .iter()
        .zip(prefix_chars.iter())
        .all(|(a, b)| a.to_ascii_lowercase() == *b)
}

fn skip_to_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && !chars[i].is_whitespace() {
        i += 1;
    }
    i
}

pub fn hash_word(word: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(word.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

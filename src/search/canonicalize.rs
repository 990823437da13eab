//! Text canonicalization for embedding input and cache keys.
//!
//! The same visual text must always produce the same canonical form, which in
//! turn produces the same content hash. Japanese spreadsheet exports mix
//! full-width and half-width forms freely, so the locale-optimized pipeline
//! applies NFKC before anything else.
//!
//! # Pipeline
//!
//! 1. **NFKC** (locale-optimized only) - `ＡＢＣ１２３` → `ABC123`, `ｶﾀｶﾅ` → `カタカナ`
//! 2. **Invisible characters** - zero-width spaces and BOMs removed
//! 3. **Whitespace** - runs collapsed to one space, trimmed
//! 4. **Truncation** - at most `max_chars` characters

use ring::digest::{self, SHA256};
use unicode_normalization::UnicodeNormalization;

/// Default maximum characters handed to an embedder.
pub const MAX_EMBED_CHARS: usize = 2000;

const INVISIBLE: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}'];

/// Canonicalize text for embedding.
///
/// With `locale_optimized` the text is NFKC-normalized first; otherwise only
/// whitespace cleanup and truncation apply.
pub fn canonicalize_for_embedding(text: &str, locale_optimized: bool, max_chars: usize) -> String {
    let normalized: String = if locale_optimized {
        text.nfkc().filter(|c| !INVISIBLE.contains(c)).collect()
    } else {
        text.chars().filter(|c| !INVISIBLE.contains(c)).collect()
    };
    truncate_to_chars(&normalize_whitespace(&normalized), max_chars)
}

/// SHA256 of the UTF-8 bytes. Canonicalize first for stable hashes.
pub fn content_hash(text: &str) -> [u8; 32] {
    let digest = digest::digest(&SHA256, text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(digest.as_ref());
    hash
}

pub fn content_hash_hex(text: &str) -> String {
    hex::encode(content_hash(text))
}

/// Embedding cache key: the same text embedded by different models must not
/// collide.
pub fn embedding_cache_key(canonical: &str, model_id: &str) -> [u8; 32] {
    let mut ctx = digest::Context::new(&SHA256);
    ctx.update(model_id.as_bytes());
    ctx.update(&[0u8]);
    ctx.update(canonical.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(ctx.finish().as_ref());
    key
}

fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut prev_whitespace = true;

    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_whitespace {
                result.push(' ');
                prev_whitespace = true;
            }
        } else {
            result.push(c);
            prev_whitespace = false;
        }
    }

    result.trim_end().to_string()
}

pub fn truncate_to_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

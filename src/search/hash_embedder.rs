//! FNV-1a feature hashing embedder.
//!
//! Deterministic, dependency-free and always available, which makes it the
//! local backend and the fallback for remote failures. Features are the
//! extractor's tokens (words, kanji/katakana bigrams) and optionally character
//! trigrams; each is hashed into one signed bucket and the result is
//! L2-normalized so inner product equals cosine similarity.

use super::embedder::{Embedder, EmbedderResult, l2_normalize};
use super::text_features::{normalize_text, tokenize};

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    char_ngrams: bool,
    id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            char_ngrams: false,
            id: format!("fnv1a-{dimension}"),
        }
    }

    /// Adds character trigrams, which helps with unsegmented Japanese text.
    pub fn with_char_ngrams(dimension: usize) -> Self {
        Self {
            dimension,
            char_ngrams: true,
            id: format!("fnv1a-ngram-{dimension}"),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 1 { -1.0 } else { 1.0 };
        vector[bucket] += sign;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return Ok(vector);
        }
        for token in tokenize(text) {
            self.add_feature(&mut vector, &token);
        }
        if self.char_ngrams {
            let chars: Vec<char> = normalize_text(text)
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            for window in chars.windows(3) {
                let gram: String = window.iter().collect();
                self.add_feature(&mut vector, &format!("#{gram}"));
            }
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

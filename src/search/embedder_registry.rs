//! Registry of local embedding models.
//!
//! Local mode selects its backend by name from this table, so an unknown
//! model id in the config surfaces as an init failure that the generator's
//! fallback policy can handle.
//!
//! | Name | ID | Notes |
//! |------|-----|-------|
//! | hash | fnv1a-{dim} | Word and kanji-bigram features (default) |
//! | hash-ngram | fnv1a-ngram-{dim} | Adds character trigrams |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::embedder::{Embedder, EmbedderError, EmbedderResult};
use super::hash_embedder::HashEmbedder;

/// Default local model name when none is configured.
pub const DEFAULT_LOCAL_MODEL: &str = "hash";

/// Where local embedding should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHint {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone)]
pub struct RegisteredEmbedder {
    pub name: &'static str,
    pub description: &'static str,
    char_ngrams: bool,
}

pub static LOCAL_EMBEDDERS: &[RegisteredEmbedder] = &[
    RegisteredEmbedder {
        name: "hash",
        description: "FNV-1a feature hashing over words and kanji bigrams",
        char_ngrams: false,
    },
    RegisteredEmbedder {
        name: "hash-ngram",
        description: "FNV-1a feature hashing with character trigrams",
        char_ngrams: true,
    },
];

pub fn lookup(name: &str) -> Option<&'static RegisteredEmbedder> {
    let name = name.trim();
    LOCAL_EMBEDDERS
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(name))
}

/// Build the local embedder registered under `name`.
pub fn get_local_embedder(
    name: &str,
    dimension: usize,
    device: DeviceHint,
) -> EmbedderResult<Arc<dyn Embedder>> {
    let Some(entry) = lookup(name) else {
        let known: Vec<&str> = LOCAL_EMBEDDERS.iter().map(|e| e.name).collect();
        return Err(EmbedderError::Unavailable(format!(
            "unknown local model '{name}' (available: {})",
            known.join(", ")
        )));
    };
    if device == DeviceHint::Gpu {
        debug!(model = entry.name, "hash embedders run on CPU; ignoring GPU hint");
    }
    let embedder: Arc<dyn Embedder> = if entry.char_ngrams {
        Arc::new(HashEmbedder::with_char_ngrams(dimension))
    } else {
        Arc::new(HashEmbedder::new(dimension))
    };
    Ok(embedder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("HASH").map(|e| e.name), Some("hash"));
        assert!(lookup("minilm").is_none());
    }

    #[test]
    fn builds_registered_embedders() {
        let e = get_local_embedder("hash-ngram", 32, DeviceHint::Cpu).unwrap();
        assert_eq!(e.dimension(), 32);
        assert_eq!(e.id(), "fnv1a-ngram-32");
    }

    #[test]
    fn unknown_model_is_unavailable() {
        let err = get_local_embedder("minilm", 32, DeviceHint::Auto).err().unwrap();
        assert!(err.to_string().contains("unknown local model"));
    }
}

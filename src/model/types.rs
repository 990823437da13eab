//! Fragment records shared by the indices.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Smallest indexed unit, as delivered by the ingestion side.
///
/// Fragments are created once while the corpus is prepared and never mutated
/// afterwards; the builder-style helpers only exist for constructing them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentFragment {
    pub id: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub text: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_kind() -> String {
    "text".to_string()
}

fn default_weight() -> f32 {
    1.0
}

impl ContentFragment {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            text: text.into(),
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Which backend produced (or would produce) an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    Local,
    Remote,
    Disabled,
}

impl EmbeddingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingMode::Local => "local",
            EmbeddingMode::Remote => "remote",
            EmbeddingMode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for EmbeddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(EmbeddingMode::Local),
            "remote" => Ok(EmbeddingMode::Remote),
            "disabled" | "off" | "none" => Ok(EmbeddingMode::Disabled),
            other => Err(other.to_string()),
        }
    }
}

/// How an embedding was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMetadata {
    pub backend: EmbeddingMode,
    pub model_id: String,
    pub locale_optimized: bool,
    /// Produced by the fallback backend after the primary failed.
    #[serde(default)]
    pub fallback_used: bool,
    #[serde(default)]
    pub cached: bool,
    /// No backend could embed the fragment; the vector is all zeros.
    #[serde(default)]
    pub failed: bool,
}

/// A fragment paired with its embedding. One per input fragment, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedFragment {
    pub fragment: ContentFragment,
    pub vector: Vec<f32>,
    pub metadata: EmbeddingMetadata,
    pub boost: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_defaults_apply_when_deserializing() {
        let frag: ContentFragment =
            serde_json::from_str(r#"{"id":"a","text":"売上高が増加"}"#).unwrap();
        assert_eq!(frag.kind, "text");
        assert_eq!(frag.weight, 1.0);
        assert!(frag.metadata.is_empty());
    }

    #[test]
    fn embedding_mode_parses_aliases() {
        assert_eq!("LOCAL".parse::<EmbeddingMode>(), Ok(EmbeddingMode::Local));
        assert_eq!("off".parse::<EmbeddingMode>(), Ok(EmbeddingMode::Disabled));
        assert!("gpu".parse::<EmbeddingMode>().is_err());
    }
}

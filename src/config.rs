//! Configuration for building and querying the index.
//!
//! Precedence: built-in defaults, then an optional TOML file, then `MMSEARCH_*`
//! environment variables (a `.env` file is honored through dotenvy).
//! [`SearchConfig::validate`] runs when the orchestrator is constructed so
//! invalid weights, modes or thresholds fail fast.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::types::EmbeddingMode;
use crate::search::embedder_registry::{DEFAULT_LOCAL_MODEL, DeviceHint};
use crate::search::facet_index::FacetRules;
use crate::search::fusion::{FusionAlgorithm, FusionConfig};
use crate::search::text_features::{TextFeatureConfig, TextFeatureExtractor};
use crate::search::vector_index::{Quantization, VectorBackend};

/// Prefix for every environment override.
pub const ENV_PREFIX: &str = "MMSEARCH_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid fusion weight `{name}`: {value} (must be finite and non-negative)")]
    InvalidWeight { name: &'static str, value: f32 },
    #[error("fusion weights must not all be zero")]
    ZeroWeights,
    #[error("unsupported embedding mode: {0}")]
    UnsupportedMode(String),
    #[error("unsupported fusion algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("unsupported quantization: {0}")]
    UnsupportedQuantization(String),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub vector: VectorConfig,
    pub semantic: SemanticConfig,
    pub facet: FacetRules,
    pub fusion: FusionSettings,
    pub text: TextFeatureConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub mode: EmbeddingMode,
    pub local_model: String,
    pub device: DeviceHint,
    pub remote_model: String,
    pub remote_endpoint: String,
    /// Environment variable holding the remote API key.
    pub api_key_env: String,
    pub remote_timeout_secs: u64,
    pub remote_retries: u32,
    pub fallback_enabled: bool,
    pub fallback_mode: EmbeddingMode,
    pub batch_size: usize,
    pub locale_optimization: bool,
    /// Ranking boost for fragments containing Japanese when locale
    /// optimization is on.
    pub locale_boost: f32,
    pub max_text_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            mode: EmbeddingMode::Local,
            local_model: DEFAULT_LOCAL_MODEL.to_string(),
            device: DeviceHint::Auto,
            remote_model: "text-embedding-3-small".to_string(),
            remote_endpoint: "https://api.openai.com/v1/embeddings".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            remote_timeout_secs: 30,
            remote_retries: 2,
            fallback_enabled: true,
            fallback_mode: EmbeddingMode::Local,
            batch_size: 32,
            locale_optimization: true,
            locale_boost: 1.1,
            max_text_chars: crate::search::canonicalize::MAX_EMBED_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Directory for the persisted embedding cache. `None` keeps it in memory.
    pub dir: Option<PathBuf>,
    pub max_embeddings: usize,
    pub max_queries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_embeddings: 100_000,
            max_queries: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub dimension: usize,
    pub default_k: usize,
    /// Vector hits scoring below this are dropped. `None` keeps everything.
    pub similarity_threshold: Option<f32>,
    /// Corpus size at which the HNSW graph replaces exact search.
    pub ann_threshold: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    pub quantization: Quantization,
    pub backend: VectorBackend,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            default_k: 10,
            similarity_threshold: None,
            ann_threshold: 10_000,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 100,
            quantization: Quantization::F32,
            backend: VectorBackend::Optimized,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub min_term_frequency: usize,
    pub max_vocabulary: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            min_term_frequency: 1,
            max_vocabulary: 50_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    pub vector_weight: f32,
    pub semantic_weight: f32,
    pub facet_weight: f32,
    pub algorithm: FusionAlgorithm,
    /// Rank constant `k` in `w / (k + rank + 1)`.
    pub rrf_k: f32,
    pub adaptive: bool,
    pub adaptive_step: f32,
    pub weight_floor: f32,
    /// Each hybrid sub-search fetches `limit * candidate_multiplier` hits.
    pub candidate_multiplier: usize,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            vector_weight: 0.4,
            semantic_weight: 0.4,
            facet_weight: 0.2,
            algorithm: FusionAlgorithm::Rrf,
            rrf_k: 60.0,
            adaptive: true,
            adaptive_step: 0.1,
            weight_floor: 0.05,
            candidate_multiplier: 3,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    dotenvy::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_mode(val: &str) -> Result<EmbeddingMode, ConfigError> {
    EmbeddingMode::from_str(val).map_err(ConfigError::UnsupportedMode)
}

fn require_positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

impl SearchConfig {
    /// Defaults, then `path` (if any), then environment overrides; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Apply `MMSEARCH_*` overrides. Unparseable numbers are ignored; an
    /// unknown mode or algorithm name is an error.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let emb = &mut self.embedding;
        if let Some(val) = env_var("EMBEDDING_MODE") {
            emb.mode = parse_mode(&val)?;
        }
        if let Some(val) = env_var("FALLBACK_MODE") {
            emb.fallback_mode = parse_mode(&val)?;
        }
        if let Some(val) = env_var("FALLBACK_ENABLED")
            && let Some(b) = parse_bool(&val)
        {
            emb.fallback_enabled = b;
        }
        if let Some(val) = env_var("LOCAL_MODEL") {
            emb.local_model = val;
        }
        if let Some(val) = env_var("REMOTE_MODEL") {
            emb.remote_model = val;
        }
        if let Some(val) = env_var("REMOTE_ENDPOINT") {
            emb.remote_endpoint = val;
        }
        if let Some(val) = env_var("API_KEY_ENV") {
            emb.api_key_env = val;
        }
        if let Some(val) = env_var("REMOTE_TIMEOUT_SECS")
            && let Ok(n) = val.trim().parse()
        {
            emb.remote_timeout_secs = n;
        }
        if let Some(val) = env_var("REMOTE_RETRIES")
            && let Ok(n) = val.trim().parse()
        {
            emb.remote_retries = n;
        }
        if let Some(val) = env_var("BATCH_SIZE")
            && let Ok(n) = val.trim().parse()
        {
            emb.batch_size = n;
        }
        if let Some(val) = env_var("LOCALE_OPTIMIZATION")
            && let Some(b) = parse_bool(&val)
        {
            emb.locale_optimization = b;
        }
        if let Some(val) = env_var("LOCALE_BOOST")
            && let Ok(n) = val.trim().parse()
        {
            emb.locale_boost = n;
        }

        if let Some(val) = env_var("CACHE_ENABLED")
            && let Some(b) = parse_bool(&val)
        {
            self.cache.enabled = b;
        }
        if let Some(val) = env_var("CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(val));
        }

        if let Some(val) = env_var("DIMENSION")
            && let Ok(n) = val.trim().parse()
        {
            self.vector.dimension = n;
        }
        if let Some(val) = env_var("DEFAULT_K")
            && let Ok(n) = val.trim().parse()
        {
            self.vector.default_k = n;
        }
        if let Some(val) = env_var("ANN_THRESHOLD")
            && let Ok(n) = val.trim().parse()
        {
            self.vector.ann_threshold = n;
        }
        if let Some(val) = env_var("QUANTIZATION") {
            self.vector.quantization = Quantization::from_str(&val)
                .map_err(|_| ConfigError::UnsupportedQuantization(val.clone()))?;
        }

        if let Some(val) = env_var("FUSION_ALGORITHM") {
            self.fusion.algorithm = FusionAlgorithm::from_str(&val)?;
        }
        if let Some(val) = env_var("VECTOR_WEIGHT")
            && let Ok(n) = val.trim().parse()
        {
            self.fusion.vector_weight = n;
        }
        if let Some(val) = env_var("SEMANTIC_WEIGHT")
            && let Ok(n) = val.trim().parse()
        {
            self.fusion.semantic_weight = n;
        }
        if let Some(val) = env_var("FACET_WEIGHT")
            && let Ok(n) = val.trim().parse()
        {
            self.fusion.facet_weight = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let emb = &self.embedding;
        require_positive("embedding.batch_size", emb.batch_size)?;
        require_positive("embedding.max_text_chars", emb.max_text_chars)?;
        if emb.remote_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "embedding.remote_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !emb.locale_boost.is_finite() || emb.locale_boost <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "embedding.locale_boost",
                reason: format!("{} is not a positive number", emb.locale_boost),
            });
        }

        require_positive("vector.dimension", self.vector.dimension)?;
        require_positive("vector.default_k", self.vector.default_k)?;
        require_positive("vector.hnsw_ef_construction", self.vector.hnsw_ef_construction)?;
        require_positive("vector.hnsw_ef_search", self.vector.hnsw_ef_search)?;
        if self.vector.hnsw_m < 2 {
            return Err(ConfigError::InvalidValue {
                name: "vector.hnsw_m",
                reason: "must be at least 2".to_string(),
            });
        }
        if let Some(threshold) = self.vector.similarity_threshold
            && !threshold.is_finite()
        {
            return Err(ConfigError::InvalidValue {
                name: "vector.similarity_threshold",
                reason: "must be finite".to_string(),
            });
        }

        require_positive("semantic.min_term_frequency", self.semantic.min_term_frequency)?;
        require_positive("semantic.max_vocabulary", self.semantic.max_vocabulary)?;
        require_positive("fusion.candidate_multiplier", self.fusion.candidate_multiplier)?;

        FusionConfig::from_settings(&self.fusion)?;
        self.facet.validate()?;
        TextFeatureExtractor::new(&self.text)?;
        Ok(())
    }

    /// Effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard(&'static str);

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            unsafe { std::env::set_var(key, val) };
            Self(key)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            unsafe { std::env::remove_var(self.0) };
        }
    }

    #[test]
    fn defaults_validate() {
        SearchConfig::default().validate().unwrap();
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mmsearch.toml");
        std::fs::write(
            &path,
            r#"
[embedding]
mode = "disabled"
batch_size = 4

[vector]
dimension = 64

[fusion]
algorithm = "weighted_sum"
facet_weight = 0.0
"#,
        )
        .unwrap();
        let cfg = SearchConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.embedding.mode, EmbeddingMode::Disabled);
        assert_eq!(cfg.embedding.batch_size, 4);
        assert_eq!(cfg.vector.dimension, 64);
        assert_eq!(cfg.fusion.algorithm, FusionAlgorithm::WeightedSum);
        assert_eq!(cfg.semantic, SemanticConfig::default());
    }

    #[test]
    fn unknown_mode_in_file_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[embedding]\nmode = \"quantum\"\n").unwrap();
        let err = SearchConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        let _mode = EnvGuard::set("MMSEARCH_EMBEDDING_MODE", "disabled");
        let _dim = EnvGuard::set("MMSEARCH_DIMENSION", "32");
        let _cache = EnvGuard::set("MMSEARCH_CACHE_ENABLED", "false");
        let cfg = SearchConfig::from_env().unwrap();
        assert_eq!(cfg.embedding.mode, EmbeddingMode::Disabled);
        assert_eq!(cfg.vector.dimension, 32);
        assert!(!cfg.cache.enabled);
    }

    #[test]
    #[serial]
    fn unknown_env_algorithm_fails_fast() {
        let _alg = EnvGuard::set("MMSEARCH_FUSION_ALGORITHM", "borda");
        let err = SearchConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedAlgorithm(_)), "{err}");
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut cfg = SearchConfig::default();
        cfg.fusion.semantic_weight = -0.1;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidWeight { name: "semantic", .. })
        ));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let mut cfg = SearchConfig::default();
        cfg.vector.dimension = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { name: "vector.dimension", .. })
        ));
    }

    #[test]
    fn effective_config_round_trips_through_toml() {
        let cfg = SearchConfig::default();
        let text = cfg.to_toml().unwrap();
        let parsed: SearchConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, cfg);
    }
}

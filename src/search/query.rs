//! Query and response types.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::search::facet_index::FacetConstraint;
use crate::search::fusion::{FusionWeights, MatchedSources};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Semantic,
    Facet,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub const ALL: [SearchMode; 4] = [
        SearchMode::Vector,
        SearchMode::Semantic,
        SearchMode::Facet,
        SearchMode::Hybrid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Semantic => "semantic",
            SearchMode::Facet => "facet",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(SearchMode::Vector),
            "semantic" | "keyword" => Ok(SearchMode::Semantic),
            "facet" => Ok(SearchMode::Facet),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

/// A text query plus optional structure.
///
/// `boosts` multiply the final score of hits whose fragment kind, or any of
/// whose metadata keys, equals the boost key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: String,
    pub mode: SearchMode,
    pub filters: Vec<FacetConstraint>,
    /// Falls back to the configured default k.
    pub limit: Option<usize>,
    pub min_score: Option<f32>,
    pub boosts: BTreeMap<String, f32>,
    /// Pre-computed query embedding; skips query embedding when present.
    pub vector: Option<Vec<f32>>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filter(mut self, constraint: FacetConstraint) -> Self {
        self.filters.push(constraint);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn with_boost(mut self, key: impl Into<String>, factor: f32) -> Self {
        self.boosts.insert(key.into(), factor);
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    /// Deterministic cache key for this query at an effective `limit`.
    pub fn cache_key(&self, limit: usize) -> u64 {
        let mut hasher = fxhash::FxHasher64::default();
        self.text.hash(&mut hasher);
        self.mode.hash(&mut hasher);
        limit.hash(&mut hasher);
        self.min_score.map(f32::to_bits).hash(&mut hasher);
        self.filters.hash(&mut hasher);
        for (key, factor) in &self.boosts {
            key.hash(&mut hasher);
            factor.to_bits().hash(&mut hasher);
        }
        self.vector
            .as_ref()
            .map(|v| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>())
            .hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Position of the fragment in the indexed corpus.
    pub position: u32,
    pub kind: String,
    pub text: String,
    pub score: f32,
    pub sources: MatchedSources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet_score: Option<f32>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
    /// Distinct fragments considered before `min_score` and `limit`.
    pub candidates: usize,
    /// Fusion weights used (hybrid only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<FusionWeights>,
    pub cached: bool,
    pub elapsed_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::facet_index::FacetDimension;

    #[test]
    fn modes_parse_and_display() {
        for mode in SearchMode::ALL {
            assert_eq!(mode.as_str().parse::<SearchMode>().unwrap(), mode);
        }
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::default(), SearchMode::Hybrid);
    }

    #[test]
    fn cache_key_covers_every_field() {
        let base = SearchQuery::new("sales").with_mode(SearchMode::Semantic);
        let key = base.cache_key(10);
        assert_eq!(key, base.clone().cache_key(10));
        assert_ne!(key, base.cache_key(11));
        assert_ne!(key, base.clone().with_min_score(0.5).cache_key(10));
        assert_ne!(key, base.clone().with_boost("table", 2.0).cache_key(10));
        assert_ne!(key, base.clone().with_vector(vec![1.0]).cache_key(10));
        assert_ne!(
            key,
            base.clone()
                .with_filter(FacetConstraint::new(FacetDimension::Temporal, "quarter", ["q3"]))
                .cache_key(10)
        );
        assert_ne!(key, base.with_mode(SearchMode::Hybrid).cache_key(10));
    }

    #[test]
    fn structured_query_deserializes_with_defaults() {
        let q: SearchQuery = serde_json::from_str(r#"{"text":"売上","mode":"facet"}"#).unwrap();
        assert_eq!(q.mode, SearchMode::Facet);
        assert!(q.filters.is_empty() && q.limit.is_none());
    }
}

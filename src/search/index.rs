//! The built, immutable index: fragments plus the three sub-indices.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::types::{ContentFragment, EmbeddingMode};
use crate::search::error::{SearchError, SearchResult};
use crate::search::facet_index::{FacetClassifier, FacetIndex, FacetRules};
use crate::search::fusion::FusionConfig;
use crate::search::semantic_index::SemanticIndex;
use crate::search::text_features::{TextFeatureConfig, TextFeatureExtractor};
use crate::search::vector_index::VectorIndex;

/// Summary of one `build_index` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildStats {
    pub fragment_count: usize,
    pub embedding_mode: Option<EmbeddingMode>,
    pub model_id: Option<String>,
    pub embedded: usize,
    pub failed_embeddings: usize,
    pub fallback_used: usize,
    pub cache_hits: usize,
    pub external_calls: usize,
    pub ann_enabled: bool,
    pub vocabulary_size: usize,
    pub business_terms: usize,
    pub facet_values: usize,
    /// Wall time per build phase, keyed by phase name.
    pub phase_ms: BTreeMap<String, f64>,
    pub total_ms: f64,
}

/// Everything a query needs. Built once, shared through `Arc`, never mutated.
#[derive(Debug)]
pub struct ComprehensiveIndex {
    fragments: Vec<ContentFragment>,
    vector: Option<VectorIndex>,
    semantic: SemanticIndex,
    facet: FacetIndex,
    fusion: FusionConfig,
    extractor: TextFeatureExtractor,
    facet_rules: FacetRules,
    stats: BuildStats,
    created_at: DateTime<Utc>,
}

/// Ranked `(position, score)` list from one sub-search.
pub type Ranked = Vec<(u32, f32)>;

impl ComprehensiveIndex {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fragments: Vec<ContentFragment>,
        vector: Option<VectorIndex>,
        semantic: SemanticIndex,
        facet: FacetIndex,
        fusion: FusionConfig,
        text_config: &TextFeatureConfig,
        facet_rules: FacetRules,
        stats: BuildStats,
        created_at: DateTime<Utc>,
    ) -> SearchResult<Self> {
        let extractor = TextFeatureExtractor::new(text_config)?;
        if let Some(vector) = &vector
            && vector.len() != fragments.len()
        {
            return Err(SearchError::Index(anyhow::anyhow!(
                "vector index has {} rows for {} fragments",
                vector.len(),
                fragments.len()
            )));
        }
        Ok(Self {
            fragments,
            vector,
            semantic,
            facet,
            fusion,
            extractor,
            facet_rules,
            stats,
            created_at,
        })
    }

    pub fn fragments(&self) -> &[ContentFragment] {
        &self.fragments
    }

    pub fn fragment(&self, position: u32) -> Option<&ContentFragment> {
        self.fragments.get(position as usize)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn vector(&self) -> Option<&VectorIndex> {
        self.vector.as_ref()
    }

    pub fn semantic(&self) -> &SemanticIndex {
        &self.semantic
    }

    pub fn facet(&self) -> &FacetIndex {
        &self.facet
    }

    pub fn fusion(&self) -> &FusionConfig {
        &self.fusion
    }

    pub fn extractor(&self) -> &TextFeatureExtractor {
        &self.extractor
    }

    pub fn text_config(&self) -> &TextFeatureConfig {
        self.extractor.config()
    }

    pub fn facet_rules(&self) -> &FacetRules {
        &self.facet_rules
    }

    pub fn classifier(&self) -> FacetClassifier<'_> {
        FacetClassifier::new(&self.facet_rules, &self.extractor)
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Vector hits with the per-fragment boost applied. Hits whose raw
    /// similarity falls below `threshold` are dropped.
    pub fn vector_hits(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&BTreeSet<u32>>,
        threshold: Option<f32>,
    ) -> SearchResult<Ranked> {
        let vector = self.vector.as_ref().ok_or(SearchError::not_ready("vector index"))?;
        if query.len() != vector.dimension() {
            return Err(SearchError::DimensionMismatch {
                expected: vector.dimension(),
                actual: query.len(),
            });
        }
        let hits = vector
            .search_top_k(query, k, filter)
            .map_err(SearchError::Index)?;
        let rows = vector.rows();
        let mut ranked: Ranked = hits
            .into_iter()
            .filter(|hit| threshold.is_none_or(|t| hit.score >= t))
            .map(|hit| {
                let boost = rows
                    .get(hit.position as usize)
                    .filter(|row| row.position == hit.position)
                    .map_or(1.0, |row| row.boost);
                (hit.position, hit.score * boost)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(ranked)
    }

    pub fn semantic_hits(&self, text: &str, k: usize, filter: Option<&BTreeSet<u32>>) -> Ranked {
        let k = if filter.is_some() { self.len() } else { k };
        self.semantic
            .search(text, &self.extractor, k)
            .into_iter()
            .filter(|hit| filter.is_none_or(|f| f.contains(&hit.position)))
            .map(|hit| (hit.position, hit.score))
            .collect()
    }

    /// Fragments scored by the facets derivable from `text`. With nothing
    /// derivable, a filtered query returns every filter match at 1.0.
    pub fn facet_hits(&self, text: &str, k: usize, filter: Option<&BTreeSet<u32>>) -> Ranked {
        let derived = self.classifier().classify_text(text);
        if derived.is_empty() {
            return filter
                .map(|f| f.iter().take(k).map(|pos| (*pos, 1.0)).collect())
                .unwrap_or_default();
        }
        let search_k = if filter.is_some() { self.len() } else { k };
        self.facet
            .search_derived(&derived, search_k)
            .into_iter()
            .filter(|hit| filter.is_none_or(|f| f.contains(&hit.position)))
            .take(k)
            .map(|hit| (hit.position, hit.score))
            .collect()
    }
}

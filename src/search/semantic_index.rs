//! Keyword and business-term index with query expansion.
//!
//! Positions are stored in ordered sets so results are deterministic. Query
//! scoring: every distinct keyword found across the query expansions adds
//! [`KEYWORD_WEIGHT`] to each fragment containing it, every distinct business
//! term adds [`BUSINESS_TERM_WEIGHT`]; scores are then divided by the best one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::SemanticConfig;
use crate::model::types::ContentFragment;
use crate::search::text_features::{TextFeatureExtractor, TextFeatures};

pub const KEYWORD_WEIGHT: f32 = 1.0;
pub const BUSINESS_TERM_WEIGHT: f32 = 2.0;

pub const CATEGORY_JAPANESE: &str = "japanese";
pub const CATEGORY_MIXED_SCRIPT: &str = "mixed_script";
pub const CATEGORY_NUMERIC: &str = "numeric";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemanticHit {
    pub position: u32,
    /// Normalized to (0, 1]; the best hit scores 1.0.
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SemanticIndex {
    terms: BTreeMap<String, BTreeSet<u32>>,
    business_terms: BTreeMap<String, BTreeSet<u32>>,
    categories: BTreeMap<String, BTreeSet<u32>>,
    fragment_count: usize,
}

fn category_names(features: &TextFeatures) -> Vec<&'static str> {
    let mut names = vec![features.category.as_str()];
    if features.locale.has_japanese {
        names.push(CATEGORY_JAPANESE);
    }
    if features.locale.mixed_script {
        names.push(CATEGORY_MIXED_SCRIPT);
    }
    if features.locale.has_numbers {
        names.push(CATEGORY_NUMERIC);
    }
    names
}

impl SemanticIndex {
    pub fn build(
        fragments: &[ContentFragment],
        extractor: &TextFeatureExtractor,
        config: &SemanticConfig,
    ) -> Self {
        let features: Vec<TextFeatures> = fragments
            .par_iter()
            .map(|fragment| extractor.extract(&fragment.text))
            .collect();

        let mut index = Self {
            fragment_count: fragments.len(),
            ..Self::default()
        };
        for (position, features) in features.iter().enumerate() {
            let position = position as u32;
            for keyword in &features.keywords {
                index.terms.entry(keyword.clone()).or_default().insert(position);
            }
            for term in &features.business_terms {
                index
                    .business_terms
                    .entry(term.clone())
                    .or_default()
                    .insert(position);
            }
            for name in category_names(features) {
                index
                    .categories
                    .entry(name.to_string())
                    .or_default()
                    .insert(position);
            }
        }
        index.prune(config);
        index
    }

    // Business terms come from curated patterns and are never pruned.
    fn prune(&mut self, config: &SemanticConfig) {
        let before = self.terms.len();
        self.terms
            .retain(|_, positions| positions.len() >= config.min_term_frequency);
        if self.terms.len() > config.max_vocabulary {
            let mut ranked: Vec<(&String, usize)> =
                self.terms.iter().map(|(t, p)| (t, p.len())).collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
            let keep: HashSet<String> = ranked
                .into_iter()
                .take(config.max_vocabulary)
                .map(|(t, _)| t.clone())
                .collect();
            self.terms.retain(|term, _| keep.contains(term));
        }
        if self.terms.len() != before {
            tracing::debug!(before, after = self.terms.len(), "pruned semantic vocabulary");
        }
    }

    /// Top `k` fragments for `query`, best first; ties keep the order in
    /// which fragments were first matched.
    pub fn search(
        &self,
        query: &str,
        extractor: &TextFeatureExtractor,
        k: usize,
    ) -> Vec<SemanticHit> {
        if k == 0 {
            return Vec::new();
        }
        let expansions = extractor.expand_query(query);
        if expansions.is_empty() {
            return Vec::new();
        }

        let mut keywords: Vec<String> = Vec::new();
        let mut business: Vec<String> = Vec::new();
        for expansion in &expansions {
            let features = extractor.extract(expansion);
            for kw in features.keywords {
                if !keywords.contains(&kw) {
                    keywords.push(kw);
                }
            }
            for term in features.business_terms {
                if !business.contains(&term) {
                    business.push(term);
                }
            }
        }

        let mut order: HashMap<u32, usize> = HashMap::new();
        let mut scored: Vec<SemanticHit> = Vec::new();
        let mut add = |positions: &BTreeSet<u32>, weight: f32| {
            for pos in positions {
                let slot = *order.entry(*pos).or_insert_with(|| {
                    scored.push(SemanticHit {
                        position: *pos,
                        score: 0.0,
                    });
                    scored.len() - 1
                });
                scored[slot].score += weight;
            }
        };
        for kw in &keywords {
            if let Some(positions) = self.terms.get(kw) {
                add(positions, KEYWORD_WEIGHT);
            }
        }
        for term in &business {
            if let Some(positions) = self.business_terms.get(term) {
                add(positions, BUSINESS_TERM_WEIGHT);
            }
        }

        let max = scored.iter().map(|h| h.score).fold(0.0f32, f32::max);
        if max <= 0.0 {
            return Vec::new();
        }
        for hit in &mut scored {
            hit.score /= max;
        }
        // Stable: equal scores keep first-matched order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        tracing::trace!(
            query,
            expansions = expansions.len(),
            keywords = keywords.len(),
            business_terms = business.len(),
            hits = scored.len(),
            "semantic search"
        );
        scored
    }

    pub fn category(&self, name: &str) -> Option<&BTreeSet<u32>> {
        self.categories.get(name)
    }

    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn term(&self, term: &str) -> Option<&BTreeSet<u32>> {
        self.terms.get(term)
    }

    pub fn business_term(&self, term: &str) -> Option<&BTreeSet<u32>> {
        self.business_terms.get(term)
    }

    pub fn vocabulary_size(&self) -> usize {
        self.terms.len()
    }

    pub fn business_term_count(&self) -> usize {
        self.business_terms.len()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }
}

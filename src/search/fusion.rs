//! Combining vector, semantic and facet result lists into one ranking.
//!
//! Three algorithms are supported:
//!
//! - **Rank fusion** (`rrf`): each ranked list contributes `w / (k + rank + 1)`
//!   with a 0-based rank; facet membership adds the flat facet weight.
//! - **Score fusion** (`score`): each ranked list is min-max normalized to
//!   [0, 1] and weighted; facet membership adds the flat facet weight.
//! - **Weighted sum** (`weighted_sum`): raw scores times their weights,
//!   including the facet match score.
//!
//! Weights are non-negative and normalized to sum to 1.0. Adaptive weighting
//! adjusts a per-query copy from [`QueryFeatures`]; the stored config never
//! changes after construction.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, FusionSettings};

/// Standard RRF constant (Cormack, Clarke and Buettcher, SIGIR 2009).
pub const RRF_K: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FusionAlgorithm {
    #[default]
    #[serde(rename = "rrf", alias = "rank")]
    Rrf,
    #[serde(rename = "score")]
    Score,
    #[serde(rename = "weighted_sum")]
    WeightedSum,
}

impl FusionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            FusionAlgorithm::Rrf => "rrf",
            FusionAlgorithm::Score => "score",
            FusionAlgorithm::WeightedSum => "weighted_sum",
        }
    }
}

impl fmt::Display for FusionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FusionAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rrf" | "rank" => Ok(FusionAlgorithm::Rrf),
            "score" => Ok(FusionAlgorithm::Score),
            "weighted_sum" | "weighted" => Ok(FusionAlgorithm::WeightedSum),
            _ => Err(ConfigError::UnsupportedAlgorithm(s.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f32,
    pub semantic: f32,
    pub facet: f32,
}

impl FusionWeights {
    pub fn sum(&self) -> f32 {
        self.vector + self.semantic + self.facet
    }

    fn normalized(self) -> Self {
        let total = self.sum();
        Self {
            vector: self.vector / total,
            semantic: self.semantic / total,
            facet: self.facet / total,
        }
    }
}

/// What adaptive weighting looks at in a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFeatures {
    pub is_business: bool,
    pub has_numbers: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub weights: FusionWeights,
    pub algorithm: FusionAlgorithm,
    pub rrf_k: f32,
    pub adaptive: bool,
    pub adaptive_step: f32,
    pub weight_floor: f32,
}

fn check_weight(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidWeight { name, value });
    }
    Ok(())
}

impl FusionConfig {
    /// Weights are validated and normalized; everything else takes defaults.
    pub fn new(
        vector: f32,
        semantic: f32,
        facet: f32,
        algorithm: FusionAlgorithm,
    ) -> Result<Self, ConfigError> {
        Self::from_settings(&FusionSettings {
            vector_weight: vector,
            semantic_weight: semantic,
            facet_weight: facet,
            algorithm,
            ..FusionSettings::default()
        })
    }

    pub fn from_settings(settings: &FusionSettings) -> Result<Self, ConfigError> {
        check_weight("vector", settings.vector_weight)?;
        check_weight("semantic", settings.semantic_weight)?;
        check_weight("facet", settings.facet_weight)?;
        let weights = FusionWeights {
            vector: settings.vector_weight,
            semantic: settings.semantic_weight,
            facet: settings.facet_weight,
        };
        if weights.sum() <= 0.0 {
            return Err(ConfigError::ZeroWeights);
        }
        if !settings.rrf_k.is_finite() || settings.rrf_k <= 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "fusion.rrf_k",
                reason: format!("{} is not a positive number", settings.rrf_k),
            });
        }
        if !settings.adaptive_step.is_finite() || !(0.0..=1.0).contains(&settings.adaptive_step) {
            return Err(ConfigError::InvalidValue {
                name: "fusion.adaptive_step",
                reason: format!("{} is outside [0, 1]", settings.adaptive_step),
            });
        }
        // Three floors must leave room for the weights to sum to one.
        if !settings.weight_floor.is_finite() || !(0.0..0.33).contains(&settings.weight_floor) {
            return Err(ConfigError::InvalidValue {
                name: "fusion.weight_floor",
                reason: format!("{} is outside [0, 0.33)", settings.weight_floor),
            });
        }
        Ok(Self {
            weights: weights.normalized(),
            algorithm: settings.algorithm,
            rrf_k: settings.rrf_k,
            adaptive: settings.adaptive,
            adaptive_step: settings.adaptive_step,
            weight_floor: settings.weight_floor,
        })
    }

    /// Per-query copy with weights nudged toward the query's character.
    ///
    /// Business queries move `adaptive_step` from vector to semantic; queries
    /// with numbers move it from vector to facet. Each weight is then clamped
    /// to `weight_floor` and the set renormalized. Returns an unchanged copy
    /// when adaptive weighting is off.
    pub fn adapted(&self, features: QueryFeatures) -> Self {
        if !self.adaptive {
            return self.clone();
        }
        let step = self.adaptive_step;
        let mut w = self.weights;
        if features.is_business {
            w.semantic += step;
            w.vector -= step;
        }
        if features.has_numbers {
            w.facet += step;
            w.vector -= step;
        }
        w.vector = w.vector.max(self.weight_floor).max(0.0);
        w.semantic = w.semantic.max(self.weight_floor).max(0.0);
        w.facet = w.facet.max(self.weight_floor).max(0.0);
        let weights = if w.sum() > 0.0 { w.normalized() } else { self.weights };
        Self {
            weights,
            ..self.clone()
        }
    }

    /// Fuse the three lists and keep the best `limit`.
    ///
    /// `vector` and `semantic` must be ranked best first. Output is sorted by
    /// descending fused score, ties broken by ascending position.
    pub fn fuse(&self, inputs: &FusionInputs<'_>, limit: usize) -> Vec<FusedHit> {
        let mut fused: BTreeMap<u32, FusedHit> = BTreeMap::new();
        let w = self.weights;

        let vector_scores = self.list_contributions(inputs.vector, w.vector);
        let semantic_scores = self.list_contributions(inputs.semantic, w.semantic);

        for ((position, raw), contribution) in inputs.vector.iter().zip(vector_scores) {
            let hit = fused.entry(*position).or_insert_with(|| FusedHit::new(*position));
            if hit.vector_score.is_none() {
                hit.vector_score = Some(*raw);
                hit.score += contribution;
            }
        }
        for ((position, raw), contribution) in inputs.semantic.iter().zip(semantic_scores) {
            let hit = fused.entry(*position).or_insert_with(|| FusedHit::new(*position));
            if hit.semantic_score.is_none() {
                hit.semantic_score = Some(*raw);
                hit.score += contribution;
            }
        }
        let mut seen_facets = HashSet::new();
        for (position, raw) in inputs.facet {
            if !seen_facets.insert(*position) {
                continue;
            }
            let hit = fused.entry(*position).or_insert_with(|| FusedHit::new(*position));
            hit.facet_score = Some(*raw);
            hit.score += match self.algorithm {
                FusionAlgorithm::WeightedSum => raw * w.facet,
                FusionAlgorithm::Rrf | FusionAlgorithm::Score => w.facet,
            };
        }

        let mut hits: Vec<FusedHit> = fused.into_values().collect();
        sort_fused(&mut hits);
        hits.truncate(limit);
        hits
    }

    fn list_contributions(&self, list: &[(u32, f32)], weight: f32) -> Vec<f32> {
        match self.algorithm {
            FusionAlgorithm::Rrf => (0..list.len())
                .map(|rank| weight / (self.rrf_k + rank as f32 + 1.0))
                .collect(),
            FusionAlgorithm::Score => min_max_normalize(list)
                .into_iter()
                .map(|s| s * weight)
                .collect(),
            FusionAlgorithm::WeightedSum => list.iter().map(|(_, s)| s * weight).collect(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        let settings = FusionSettings::default();
        let weights = FusionWeights {
            vector: settings.vector_weight,
            semantic: settings.semantic_weight,
            facet: settings.facet_weight,
        };
        Self {
            weights: weights.normalized(),
            algorithm: settings.algorithm,
            rrf_k: settings.rrf_k,
            adaptive: settings.adaptive,
            adaptive_step: settings.adaptive_step,
            weight_floor: settings.weight_floor,
        }
    }
}

/// Scores in [0, 1]; a constant list maps to 1.0.
fn min_max_normalize(list: &[(u32, f32)]) -> Vec<f32> {
    let (min, max) = list
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), (_, s)| {
            (lo.min(*s), hi.max(*s))
        });
    let range = max - min;
    list.iter()
        .map(|(_, s)| if range > f32::EPSILON { (s - min) / range } else { 1.0 })
        .collect()
}

fn sort_fused(hits: &mut [FusedHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.position.cmp(&b.position))
    });
}

/// Per-source result lists as `(position, score)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FusionInputs<'a> {
    pub vector: &'a [(u32, f32)],
    pub semantic: &'a [(u32, f32)],
    pub facet: &'a [(u32, f32)],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedSources {
    pub vector: bool,
    pub semantic: bool,
    pub facet: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub position: u32,
    pub score: f32,
    pub vector_score: Option<f32>,
    pub semantic_score: Option<f32>,
    pub facet_score: Option<f32>,
}

impl FusedHit {
    fn new(position: u32) -> Self {
        Self {
            position,
            score: 0.0,
            vector_score: None,
            semantic_score: None,
            facet_score: None,
        }
    }

    pub fn sources(&self) -> MatchedSources {
        MatchedSources {
            vector: self.vector_score.is_some(),
            semantic: self.semantic_score.is_some(),
            facet: self.facet_score.is_some(),
        }
    }
}

/// Summary of one result list, with IR metrics when ground truth is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub result_count: usize,
    pub mean_score: f32,
    pub min_score: f32,
    pub max_score: f32,
    pub score_spread: f32,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

/// Evaluate `results` (fragment id, score) against optional relevant ids.
pub fn evaluate_quality(results: &[(&str, f32)], ground_truth: Option<&[String]>) -> QualityReport {
    let mut report = QualityReport {
        result_count: results.len(),
        ..QualityReport::default()
    };
    if !results.is_empty() {
        let scores = results.iter().map(|(_, s)| *s);
        report.min_score = scores.clone().fold(f32::INFINITY, f32::min);
        report.max_score = scores.clone().fold(f32::NEG_INFINITY, f32::max);
        report.mean_score = scores.sum::<f32>() / results.len() as f32;
        report.score_spread = report.max_score - report.min_score;
    }

    if let Some(truth) = ground_truth {
        let relevant: HashSet<&str> = truth.iter().map(String::as_str).collect();
        let retrieved: HashSet<&str> = results.iter().map(|(id, _)| *id).collect();
        let true_positives = retrieved.intersection(&relevant).count() as f64;
        let precision = if retrieved.is_empty() {
            0.0
        } else {
            true_positives / retrieved.len() as f64
        };
        let recall = if relevant.is_empty() {
            0.0
        } else {
            true_positives / relevant.len() as f64
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        report.precision = Some(precision);
        report.recall = Some(recall);
        report.f1 = Some(f1);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(algorithm: FusionAlgorithm) -> FusionConfig {
        FusionConfig::new(0.4, 0.4, 0.2, algorithm).unwrap()
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!("rrf".parse::<FusionAlgorithm>().unwrap(), FusionAlgorithm::Rrf);
        assert_eq!("RANK".parse::<FusionAlgorithm>().unwrap(), FusionAlgorithm::Rrf);
        assert_eq!("score".parse::<FusionAlgorithm>().unwrap(), FusionAlgorithm::Score);
        assert_eq!(
            "weighted-sum".parse::<FusionAlgorithm>().unwrap(),
            FusionAlgorithm::WeightedSum
        );
        assert!(matches!(
            "borda".parse::<FusionAlgorithm>(),
            Err(ConfigError::UnsupportedAlgorithm(name)) if name == "borda"
        ));
    }

    #[test]
    fn weights_are_validated_and_normalized() {
        let cfg = FusionConfig::new(2.0, 1.0, 1.0, FusionAlgorithm::Rrf).unwrap();
        assert!((cfg.weights.sum() - 1.0).abs() < 1e-6);
        assert!((cfg.weights.vector - 0.5).abs() < 1e-6);
        assert!(matches!(
            FusionConfig::new(0.5, f32::NAN, 0.5, FusionAlgorithm::Rrf),
            Err(ConfigError::InvalidWeight { name: "semantic", .. })
        ));
        assert!(matches!(
            FusionConfig::new(0.0, 0.0, 0.0, FusionAlgorithm::Rrf),
            Err(ConfigError::ZeroWeights)
        ));
    }

    #[test]
    fn rrf_rewards_agreement_between_lists() {
        let vector = [(1, 0.9), (2, 0.8), (3, 0.7)];
        let semantic = [(3, 1.0), (1, 0.8), (4, 0.5)];
        let fused = config(FusionAlgorithm::Rrf).fuse(
            &FusionInputs {
                vector: &vector,
                semantic: &semantic,
                facet: &[],
            },
            10,
        );
        let top: Vec<u32> = fused.iter().take(2).map(|h| h.position).collect();
        assert!(top.contains(&1) && top.contains(&3), "{top:?}");
        assert_eq!(fused.len(), 4);
        assert!(fused[0].sources().vector && fused[0].sources().semantic);
    }

    #[test]
    fn facet_membership_adds_flat_weight() {
        let vector = [(1, 0.9), (2, 0.8)];
        let facet = [(2, 0.5)];
        let cfg = config(FusionAlgorithm::Rrf);
        let fused = cfg.fuse(
            &FusionInputs {
                vector: &vector,
                semantic: &[],
                facet: &facet,
            },
            10,
        );
        assert_eq!(fused[0].position, 2);
        let expected = cfg.weights.vector / (cfg.rrf_k + 2.0) + cfg.weights.facet;
        assert!((fused[0].score - expected).abs() < 1e-6);
    }

    #[test]
    fn score_fusion_normalizes_each_list() {
        let vector = [(0, 10.0), (1, 5.0), (2, 0.0)];
        let cfg = FusionConfig::new(1.0, 0.0, 0.0, FusionAlgorithm::Score).unwrap();
        let fused = cfg.fuse(
            &FusionInputs {
                vector: &vector,
                ..Default::default()
            },
            10,
        );
        let scores: Vec<f32> = fused.iter().map(|h| h.score).collect();
        assert_eq!(scores, vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn constant_list_normalizes_to_one() {
        assert_eq!(min_max_normalize(&[(0, 0.3), (1, 0.3)]), vec![1.0, 1.0]);
    }

    #[test]
    fn weighted_sum_uses_raw_scores() {
        let semantic = [(4, 1.0)];
        let facet = [(4, 0.5)];
        let cfg = FusionConfig::new(0.0, 0.5, 0.5, FusionAlgorithm::WeightedSum).unwrap();
        let fused = cfg.fuse(
            &FusionInputs {
                vector: &[],
                semantic: &semantic,
                facet: &facet,
            },
            10,
        );
        assert!((fused[0].score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn output_is_truncated_and_ties_break_by_position() {
        let vector = [(5, 1.0), (3, 1.0)];
        let cfg = FusionConfig::new(1.0, 0.0, 0.0, FusionAlgorithm::Score).unwrap();
        let fused = cfg.fuse(
            &FusionInputs {
                vector: &vector,
                ..Default::default()
            },
            1,
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].position, 3);
    }

    #[test]
    fn adaptive_weights_follow_query_features() {
        let cfg = config(FusionAlgorithm::Rrf);
        let business = cfg.adapted(QueryFeatures {
            is_business: true,
            has_numbers: false,
        });
        assert!(business.weights.semantic > cfg.weights.semantic);
        assert!(business.weights.vector < cfg.weights.vector);

        let numeric = cfg.adapted(QueryFeatures {
            is_business: false,
            has_numbers: true,
        });
        assert!(numeric.weights.facet > cfg.weights.facet);

        for adapted in [business, numeric] {
            assert!((adapted.weights.sum() - 1.0).abs() < 1e-6);
        }
        assert_eq!(cfg.adapted(QueryFeatures::default()).weights, cfg.weights);
    }

    #[test]
    fn adaptive_weights_respect_the_floor() {
        let mut settings = FusionSettings {
            vector_weight: 0.1,
            semantic_weight: 0.8,
            facet_weight: 0.1,
            adaptive_step: 0.5,
            ..FusionSettings::default()
        };
        let cfg = FusionConfig::from_settings(&settings).unwrap();
        let adapted = cfg.adapted(QueryFeatures {
            is_business: true,
            has_numbers: true,
        });
        assert!(adapted.weights.vector > 0.0);
        assert!(adapted.weights.vector >= cfg.weight_floor / 2.0);

        settings.adaptive = false;
        let fixed = FusionConfig::from_settings(&settings).unwrap();
        assert_eq!(
            fixed.adapted(QueryFeatures {
                is_business: true,
                has_numbers: true
            }),
            fixed
        );
    }

    #[test]
    fn quality_report_with_ground_truth() {
        let results = [("a", 0.9), ("b", 0.5), ("c", 0.1)];
        let truth = vec!["a".to_string(), "d".to_string()];
        let report = evaluate_quality(&results, Some(&truth));
        assert_eq!(report.result_count, 3);
        assert!((report.score_spread - 0.8).abs() < 1e-6);
        assert!((report.mean_score - 0.5).abs() < 1e-6);
        assert!((report.precision.unwrap() - 1.0 / 3.0).abs() < 1e-9);
        assert!((report.recall.unwrap() - 0.5).abs() < 1e-9);
        assert!((report.f1.unwrap() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn quality_report_without_ground_truth() {
        let report = evaluate_quality(&[], None);
        assert_eq!(report, QualityReport::default());
    }
}

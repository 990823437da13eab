use std::collections::BTreeSet;

use proptest::prelude::*;

use multimodal_search::config::{FusionSettings, SemanticConfig};
use multimodal_search::model::types::ContentFragment;
use multimodal_search::search::embedder::{Embedder, l2_normalize};
use multimodal_search::search::facet_index::{
    FacetClassifier, FacetConstraint, FacetDimension, FacetIndex, FacetRules,
};
use multimodal_search::search::fusion::{FusionConfig, QueryFeatures};
use multimodal_search::search::hash_embedder::HashEmbedder;
use multimodal_search::search::semantic_index::SemanticIndex;
use multimodal_search::search::text_features::{TextFeatureConfig, TextFeatureExtractor};
use multimodal_search::search::vector_index::{
    Quantization, VectorEntry, VectorIndex, VectorSearchParams,
};

fn unit_vectors(dim: usize, max: usize) -> impl Strategy<Value = Vec<Vec<f32>>> {
    prop::collection::vec(prop::collection::vec(-1.0f32..1.0, dim), 1..max).prop_map(|rows| {
        rows.into_iter()
            .map(|mut v| {
                l2_normalize(&mut v);
                v
            })
            .collect()
    })
}

fn index_of(vectors: &[Vec<f32>]) -> VectorIndex {
    let entries = vectors.iter().enumerate().map(|(i, v)| VectorEntry {
        position: i as u32,
        boost: 1.0,
        content_hash: [0u8; 32],
        vector: v.clone(),
    });
    VectorIndex::build(
        "prop",
        vectors[0].len(),
        Quantization::F32,
        VectorSearchParams::default(),
        entries,
    )
    .unwrap()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn fragments_from(kinds: &[u8]) -> Vec<ContentFragment> {
    const TEXTS: [&str; 4] = [
        "sales rose 15% in Q3 2024",
        "営業部 headcount update for FY2023",
        "system latency improved in Q4",
        "revenue of 500 million yen in March",
    ];
    const KINDS: [&str; 3] = ["text", "table", "heading"];
    kinds
        .iter()
        .enumerate()
        .map(|(i, k)| {
            ContentFragment::new(
                format!("p{i}"),
                KINDS[*k as usize % KINDS.len()],
                TEXTS[(i + *k as usize) % TEXTS.len()],
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn vector_results_are_bounded_and_sorted(
        vectors in unit_vectors(8, 40),
        query in prop::collection::vec(-1.0f32..1.0, 8),
        k in 0usize..50,
    ) {
        let index = index_of(&vectors);
        let hits = index.search_top_k(&query, k, None).unwrap();
        prop_assert!(hits.len() <= k.min(vectors.len()));
        prop_assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn exact_and_cosine_scan_agree_on_top_one(
        vectors in unit_vectors(12, 30),
        mut query in prop::collection::vec(-1.0f32..1.0, 12),
    ) {
        l2_normalize(&mut query);
        prop_assume!(query.iter().any(|v| *v != 0.0));
        let index = index_of(&vectors);
        let exact = index.search_top_k(&query, 1, None).unwrap();
        let scan = index.search_cosine_scan(&query, 1, None).unwrap();
        prop_assert_eq!(exact.len(), 1);
        prop_assert_eq!(scan.len(), 1);
        let best = vectors.iter().map(|v| dot(v, &query)).fold(f32::NEG_INFINITY, f32::max);
        let scan_top = dot(&vectors[scan[0].position as usize], &query);
        prop_assert!((exact[0].score - best).abs() < 1e-4);
        prop_assert!((scan_top - best).abs() < 1e-4);
    }

    #[test]
    fn unique_term_scores_one(n in 2usize..12, pick in 0usize..12) {
        let pick = pick % n;
        let fragments: Vec<ContentFragment> = (0..n)
            .map(|i| ContentFragment::new(format!("u{i}"), "text", format!("shared words marker{i}x")))
            .collect();
        let extractor = TextFeatureExtractor::new(&TextFeatureConfig::default()).unwrap();
        let index = SemanticIndex::build(&fragments, &extractor, &SemanticConfig::default());
        let hits = index.search(&format!("marker{pick}x"), &extractor, 10);
        prop_assert_eq!(hits.len(), 1);
        prop_assert_eq!(hits[0].position as usize, pick);
        prop_assert_eq!(hits[0].score, 1.0);
    }

    #[test]
    fn facet_filtering_is_associative(kinds in prop::collection::vec(0u8..6, 1..24)) {
        let fragments = fragments_from(&kinds);
        let extractor = TextFeatureExtractor::new(&TextFeatureConfig::default()).unwrap();
        let rules = FacetRules::default();
        let index = FacetIndex::build(&fragments, &FacetClassifier::new(&rules, &extractor));

        let a = FacetConstraint::new(FacetDimension::Categorical, "content_type", ["text", "table"]);
        let b = FacetConstraint::new(FacetDimension::Temporal, "quarter", ["q3", "q4"]);
        let c = FacetConstraint::new(FacetDimension::Temporal, "year", ["2024"]);

        let all = index.filter(&[a.clone(), b.clone(), c.clone()]);
        let left = index.filter_within(&index.filter(&[a.clone(), b.clone()]), &[c.clone()]);
        let right = index.filter_within(&index.filter(&[a.clone()]), &[b.clone(), c.clone()]);
        let reordered = index.filter(&[c, b, a]);
        prop_assert_eq!(&all, &left);
        prop_assert_eq!(&all, &right);
        prop_assert_eq!(&all, &reordered);
        prop_assert!(index.filter(&[]).is_empty());
        let everything: BTreeSet<u32> = (0..fragments.len() as u32).collect();
        prop_assert_eq!(index.filter_within(&everything, &[]), everything);
    }

    #[test]
    fn adapted_weights_always_sum_to_one(
        vector in 0.0f32..5.0,
        semantic in 0.0f32..5.0,
        facet in 0.0f32..5.0,
        step in 0.0f32..1.0,
        floor in 0.0f32..0.3,
        is_business: bool,
        has_numbers: bool,
    ) {
        prop_assume!(vector + semantic + facet > 1e-3);
        let config = FusionConfig::from_settings(&FusionSettings {
            vector_weight: vector,
            semantic_weight: semantic,
            facet_weight: facet,
            adaptive_step: step,
            weight_floor: floor,
            ..FusionSettings::default()
        })
        .unwrap();
        let adapted = config.adapted(QueryFeatures { is_business, has_numbers });
        let w = adapted.weights;
        prop_assert!((w.sum() - 1.0).abs() < 1e-6);
        prop_assert!(w.vector >= 0.0 && w.semantic >= 0.0 && w.facet >= 0.0);
    }

    #[test]
    fn hash_embeddings_are_deterministic(text in ".*", dim in 1usize..128) {
        let embedder = HashEmbedder::new(dim);
        let first = embedder.embed(&text).unwrap();
        let second = embedder.embed(&text).unwrap();
        prop_assert_eq!(first.len(), dim);
        prop_assert_eq!(first, second);
    }
}

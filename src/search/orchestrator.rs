//! Search orchestrator: builds the comprehensive index and answers queries.
//!
//! The current index lives behind an `RwLock<Option<Arc<_>>>`. A build
//! assembles a complete new index off to the side and swaps it in only after
//! every phase succeeded, so queries never observe a partial index. Hybrid
//! queries fan out to the three sub-searches on a `JoinSet` and fuse once all
//! of them have finished.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::model::types::ContentFragment;
use crate::search::cache::{CacheStats, EmbeddingCache, QueryCache};
use crate::search::embedding_generator::{
    BuildPhase, BuildProgress, EmbeddingBatch, EmbeddingGenerator, ProgressFn,
};
use crate::search::error::{SearchError, SearchResult};
use crate::search::facet_index::{FacetClassifier, FacetIndex};
use crate::search::fusion::{
    FusionConfig, FusionInputs, MatchedSources, QualityReport, QueryFeatures, evaluate_quality,
};
use crate::search::index::{BuildStats, ComprehensiveIndex, Ranked};
use crate::search::query::{SearchHit, SearchMode, SearchQuery, SearchResponse};
use crate::search::semantic_index::SemanticIndex;
use crate::search::text_features::{LexicalCategory, TextFeatureExtractor};
use crate::search::vector_index::{VectorIndex, VectorSearchParams};

/// File name of the persisted embedding cache inside `cache.dir`.
pub const EMBEDDING_CACHE_FILE: &str = "embeddings.msgpack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrchestratorCacheStats {
    pub embedding: CacheStats,
    pub query: CacheStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchMetrics {
    pub queries: u64,
    pub queries_by_mode: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub avg_latency_ms: f64,
    pub last_build: Option<BuildStats>,
}

#[derive(Debug, Default)]
struct MetricsState {
    queries: u64,
    queries_by_mode: BTreeMap<String, u64>,
    cache_hits: u64,
    cache_misses: u64,
    total_latency_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Vector,
    Semantic,
    Facet,
}

/// One candidate before dedup, boosts and cut-offs.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    position: u32,
    score: f32,
    vector_score: Option<f32>,
    semantic_score: Option<f32>,
    facet_score: Option<f32>,
}

impl Candidate {
    fn single(source: Source, position: u32, score: f32) -> Self {
        let some = |s: Source| (s == source).then_some(score);
        Self {
            position,
            score,
            vector_score: some(Source::Vector),
            semantic_score: some(Source::Semantic),
            facet_score: some(Source::Facet),
        }
    }

    fn sources(&self) -> MatchedSources {
        MatchedSources {
            vector: self.vector_score.is_some(),
            semantic: self.semantic_score.is_some(),
            facet: self.facet_score.is_some(),
        }
    }
}

pub struct SearchOrchestrator {
    config: SearchConfig,
    generator: Option<EmbeddingGenerator>,
    embedding_cache: Arc<EmbeddingCache>,
    query_cache: QueryCache<SearchResponse>,
    index: RwLock<Option<Arc<ComprehensiveIndex>>>,
    metrics: Mutex<MetricsState>,
    last_build: Mutex<Option<BuildStats>>,
}

impl std::fmt::Debug for SearchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOrchestrator")
            .field("generator", &self.generator)
            .field("ready", &self.index.read().is_some())
            .finish_non_exhaustive()
    }
}

impl SearchOrchestrator {
    /// Validate `config` and set up caches and the embedding generator.
    pub fn new(config: SearchConfig) -> SearchResult<Self> {
        Self::construct(config, true)
    }

    /// No embedding backend: vector search needs explicit query vectors.
    pub fn without_embeddings(config: SearchConfig) -> SearchResult<Self> {
        Self::construct(config, false)
    }

    /// Serve a previously built (typically loaded) index.
    pub fn from_index(config: SearchConfig, index: ComprehensiveIndex) -> SearchResult<Self> {
        Self::serve(Self::new(config)?, index)
    }

    /// Serve a loaded index without an embedding backend. Vector-mode
    /// queries must then carry an explicit query vector.
    pub fn from_index_without_embeddings(
        config: SearchConfig,
        index: ComprehensiveIndex,
    ) -> SearchResult<Self> {
        Self::serve(Self::without_embeddings(config)?, index)
    }

    fn serve(orchestrator: Self, index: ComprehensiveIndex) -> SearchResult<Self> {
        if let (Some(generator), Some(vector)) = (&orchestrator.generator, index.vector())
            && generator.model_id() != vector.embedder_id()
        {
            warn!(
                index_model = vector.embedder_id(),
                query_model = generator.model_id(),
                "query embedder differs from the one that built the index"
            );
        }
        orchestrator.install(index);
        Ok(orchestrator)
    }

    fn construct(config: SearchConfig, with_embeddings: bool) -> SearchResult<Self> {
        config.validate()?;
        let embedding_cache = Arc::new(EmbeddingCache::new(
            config.cache.enabled,
            config.cache.max_embeddings,
        ));
        if let Some(path) = embedding_cache_path(&config) {
            match embedding_cache.load(&path) {
                Ok(0) => {}
                Ok(loaded) => info!(loaded, path = %path.display(), "loaded embedding cache"),
                Err(err) => warn!(error = %format!("{err:#}"), "ignoring unreadable embedding cache"),
            }
        }
        let generator = with_embeddings
            .then(|| EmbeddingGenerator::new(&config, Arc::clone(&embedding_cache)));
        Ok(Self {
            query_cache: QueryCache::new(config.cache.max_queries),
            config,
            generator,
            embedding_cache,
            index: RwLock::new(None),
            metrics: Mutex::new(MetricsState::default()),
            last_build: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn generator(&self) -> Option<&EmbeddingGenerator> {
        self.generator.as_ref()
    }

    /// Currently served index, if any.
    pub fn index(&self) -> Option<Arc<ComprehensiveIndex>> {
        self.index.read().clone()
    }

    fn current_index(&self) -> SearchResult<Arc<ComprehensiveIndex>> {
        self.index().ok_or(SearchError::not_ready("index"))
    }

    /// Replace the served index and drop cached query results.
    pub fn install(&self, index: ComprehensiveIndex) -> Arc<ComprehensiveIndex> {
        let index = Arc::new(index);
        *self.index.write() = Some(Arc::clone(&index));
        self.query_cache.clear();
        index
    }

    /// Build a new index from `fragments` in four phases and swap it in.
    pub async fn build_index(
        &self,
        fragments: Vec<ContentFragment>,
        progress: Option<ProgressFn>,
    ) -> SearchResult<Arc<ComprehensiveIndex>> {
        let start = Instant::now();
        let total = fragments.len();
        let mut stats = BuildStats {
            fragment_count: total,
            ..BuildStats::default()
        };
        info!(fragments = total, "building index");

        // Phase 1: embeddings.
        let phase_start = Instant::now();
        let batch = match &self.generator {
            Some(generator) => {
                let batch = generator
                    .embed_fragments(fragments.clone(), progress.clone())
                    .await?;
                stats.embedding_mode = Some(generator.mode());
                stats.model_id = Some(generator.model_id().to_string());
                Some((generator.model_id().to_string(), batch))
            }
            None => None,
        };
        if let Some((_, batch)) = &batch {
            let m = &batch.metrics;
            stats.embedded = m.succeeded;
            stats.failed_embeddings = m.failed;
            stats.fallback_used = m.fallback_used;
            stats.cache_hits = m.cache_hits;
            stats.external_calls = m.external_calls;
        }
        record_phase(&mut stats, BuildPhase::Embedding, phase_start);
        info!(
            embedded = stats.embedded,
            failed = stats.failed_embeddings,
            fallback = stats.fallback_used,
            "phase 1/4: embeddings ready"
        );

        let config = self.config.clone();
        let index = tokio::task::spawn_blocking(move || {
            assemble_index(&config, fragments, batch, stats, progress.as_ref())
        })
        .await??;

        let index = self.install(index);
        *self.last_build.lock() = Some(index.stats().clone());
        if let Err(err) = self.persist_embedding_cache() {
            warn!(error = %err, "failed to persist embedding cache");
        }
        info!(
            fragments = index.len(),
            total_ms = start.elapsed().as_secs_f64() * 1000.0,
            "index ready"
        );
        Ok(index)
    }

    /// Write the embedding cache to `cache.dir`, when one is configured.
    pub fn persist_embedding_cache(&self) -> SearchResult<()> {
        let Some(path) = embedding_cache_path(&self.config) else {
            return Ok(());
        };
        if self.embedding_cache.is_empty() {
            return Ok(());
        }
        self.embedding_cache.save(&path).map_err(SearchError::Index)
    }

    /// Answer `query`. Repeated identical queries are served from the
    /// query cache.
    pub async fn search(&self, query: SearchQuery) -> SearchResult<SearchResponse> {
        let start = Instant::now();
        let index = self.current_index()?;
        let limit = query.limit.unwrap_or(self.config.vector.default_k);
        let key = query.cache_key(limit);

        if let Some(mut cached) = self.query_cache.get(key) {
            cached.cached = true;
            cached.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            self.record_query(query.mode, true, cached.elapsed_ms);
            debug!(query = %query.text, mode = %query.mode, "query cache hit");
            return Ok(cached);
        }

        let mut response = self.execute(&index, &query, limit).await?;
        response.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.query_cache.insert(key, response.clone());
        self.record_query(query.mode, false, response.elapsed_ms);
        debug!(
            query = %query.text,
            mode = %query.mode,
            hits = response.hits.len(),
            candidates = response.candidates,
            elapsed_ms = response.elapsed_ms,
            "search complete"
        );
        Ok(response)
    }

    async fn execute(
        &self,
        index: &Arc<ComprehensiveIndex>,
        query: &SearchQuery,
        limit: usize,
    ) -> SearchResult<SearchResponse> {
        let mut response = SearchResponse {
            query: query.text.clone(),
            mode: query.mode,
            hits: Vec::new(),
            candidates: 0,
            weights: None,
            cached: false,
            elapsed_ms: 0.0,
        };
        let blank = query.text.trim().is_empty() && query.vector.is_none();
        if limit == 0 || index.is_empty() || (blank && query.filters.is_empty()) {
            return Ok(response);
        }

        let filter = (!query.filters.is_empty())
            .then(|| Arc::new(index.facet().filter(&query.filters)));
        if filter.as_ref().is_some_and(|f| f.is_empty()) {
            return Ok(response);
        }
        let k = limit.saturating_mul(self.config.fusion.candidate_multiplier);
        let threshold = self.config.vector.similarity_threshold;
        let filter_ref = filter.as_deref();

        let candidates: Vec<Candidate> = match query.mode {
            SearchMode::Vector => {
                if index.vector().is_none() {
                    return Err(SearchError::not_ready("vector index"));
                }
                let vector = self
                    .query_vector(index, query)
                    .await?
                    .ok_or(SearchError::QueryVectorRequired)?;
                index
                    .vector_hits(&vector, k, filter_ref, threshold)?
                    .into_iter()
                    .map(|(pos, score)| Candidate::single(Source::Vector, pos, score))
                    .collect()
            }
            SearchMode::Semantic => index
                .semantic_hits(&query.text, k, filter_ref)
                .into_iter()
                .map(|(pos, score)| Candidate::single(Source::Semantic, pos, score))
                .collect(),
            SearchMode::Facet => index
                .facet_hits(&query.text, k, filter_ref)
                .into_iter()
                .map(|(pos, score)| Candidate::single(Source::Facet, pos, score))
                .collect(),
            SearchMode::Hybrid => {
                let vector = if index.vector().is_some() {
                    self.query_vector(index, query).await.unwrap_or_else(|err| {
                        debug!(error = %err, "hybrid query continues without vector search");
                        None
                    })
                } else {
                    None
                };
                let (fusion, candidates) =
                    hybrid_candidates(index, query, vector, filter.clone(), k, threshold).await?;
                response.weights = Some(fusion.weights);
                candidates
            }
        };

        let hits = finalize(index, query, candidates, limit, &mut response.candidates);
        response.hits = hits;
        Ok(response)
    }

    /// Explicit query vector, or the embedded query text. `None` when no
    /// embedding backend is configured.
    async fn query_vector(
        &self,
        index: &ComprehensiveIndex,
        query: &SearchQuery,
    ) -> SearchResult<Option<Vec<f32>>> {
        if let Some(vector) = &query.vector {
            if let Some(vi) = index.vector()
                && vi.dimension() != vector.len()
            {
                return Err(SearchError::DimensionMismatch {
                    expected: vi.dimension(),
                    actual: vector.len(),
                });
            }
            return Ok(Some(vector.clone()));
        }
        match &self.generator {
            Some(generator) => generator.embed_query(&query.text).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run `query` and score the results against `ground_truth` ids.
    pub async fn evaluate(
        &self,
        query: SearchQuery,
        ground_truth: Option<&[String]>,
    ) -> SearchResult<QualityReport> {
        let response = self.search(query).await?;
        let results: Vec<(&str, f32)> = response
            .hits
            .iter()
            .map(|hit| (hit.id.as_str(), hit.score))
            .collect();
        Ok(evaluate_quality(&results, ground_truth))
    }

    pub fn clear_caches(&self) {
        self.embedding_cache.clear();
        self.query_cache.clear();
        debug!("caches cleared");
    }

    pub fn cache_stats(&self) -> OrchestratorCacheStats {
        OrchestratorCacheStats {
            embedding: self.embedding_cache.stats(),
            query: self.query_cache.stats(),
        }
    }

    pub fn metrics(&self) -> SearchMetrics {
        let state = self.metrics.lock();
        SearchMetrics {
            queries: state.queries,
            queries_by_mode: state.queries_by_mode.clone(),
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            avg_latency_ms: if state.queries == 0 {
                0.0
            } else {
                state.total_latency_ms / state.queries as f64
            },
            last_build: self.last_build.lock().clone(),
        }
    }

    fn record_query(&self, mode: SearchMode, cached: bool, elapsed_ms: f64) {
        let mut state = self.metrics.lock();
        state.queries += 1;
        *state
            .queries_by_mode
            .entry(mode.as_str().to_string())
            .or_default() += 1;
        if cached {
            state.cache_hits += 1;
        } else {
            state.cache_misses += 1;
        }
        state.total_latency_ms += elapsed_ms;
    }
}

fn embedding_cache_path(config: &SearchConfig) -> Option<PathBuf> {
    if !config.cache.enabled {
        return None;
    }
    config
        .cache
        .dir
        .as_ref()
        .map(|dir| dir.join(EMBEDDING_CACHE_FILE))
}

fn record_phase(stats: &mut BuildStats, phase: BuildPhase, start: Instant) {
    stats
        .phase_ms
        .insert(phase.as_str().to_string(), start.elapsed().as_secs_f64() * 1000.0);
}

fn report(progress: Option<&ProgressFn>, phase: BuildPhase, completed: usize, total: usize) {
    if let Some(progress) = progress {
        progress(BuildProgress {
            phase,
            completed,
            total,
        });
    }
}

/// Phases 2 to 4. Runs on the blocking pool.
fn assemble_index(
    config: &SearchConfig,
    fragments: Vec<ContentFragment>,
    batch: Option<(String, EmbeddingBatch)>,
    mut stats: BuildStats,
    progress: Option<&ProgressFn>,
) -> SearchResult<ComprehensiveIndex> {
    let start = Instant::now();
    let total = fragments.len();

    let phase_start = Instant::now();
    let vector = match batch {
        Some((model_id, batch)) => Some(
            VectorIndex::from_embedded(
                model_id,
                config.vector.dimension,
                config.vector.quantization,
                VectorSearchParams::from_config(&config.vector),
                &batch.fragments,
            )
            .map_err(SearchError::Index)?,
        ),
        None => None,
    };
    stats.ann_enabled = vector.as_ref().is_some_and(VectorIndex::uses_ann);
    record_phase(&mut stats, BuildPhase::VectorIndex, phase_start);
    report(progress, BuildPhase::VectorIndex, total, total);
    info!(ann = stats.ann_enabled, "phase 2/4: vector index ready");

    let phase_start = Instant::now();
    let extractor = TextFeatureExtractor::new(&config.text)?;
    let classifier = FacetClassifier::new(&config.facet, &extractor);
    let (semantic, facet) = rayon::join(
        || SemanticIndex::build(&fragments, &extractor, &config.semantic),
        || FacetIndex::build(&fragments, &classifier),
    );
    stats.vocabulary_size = semantic.vocabulary_size();
    stats.business_terms = semantic.business_term_count();
    stats.facet_values = facet.summary().iter().map(|(_, _, n)| n).sum();
    record_phase(&mut stats, BuildPhase::SemanticFacet, phase_start);
    report(progress, BuildPhase::SemanticFacet, total, total);
    info!(
        vocabulary = stats.vocabulary_size,
        business_terms = stats.business_terms,
        facet_values = stats.facet_values,
        "phase 3/4: semantic and facet indices ready"
    );

    let phase_start = Instant::now();
    let fusion = FusionConfig::from_settings(&config.fusion)?;
    record_phase(&mut stats, BuildPhase::Fusion, phase_start);
    report(progress, BuildPhase::Fusion, total, total);
    info!(algorithm = %fusion.algorithm, "phase 4/4: fusion configured");

    stats.total_ms = stats
        .phase_ms
        .get(BuildPhase::Embedding.as_str())
        .copied()
        .unwrap_or_default()
        + start.elapsed().as_secs_f64() * 1000.0;
    ComprehensiveIndex::new(
        fragments,
        vector,
        semantic,
        facet,
        fusion,
        &config.text,
        config.facet.clone(),
        stats,
        Utc::now(),
    )
}

fn query_features(index: &ComprehensiveIndex, text: &str) -> QueryFeatures {
    let features = index.extractor().extract(text);
    QueryFeatures {
        is_business: features.category == LexicalCategory::Business
            || !features.business_terms.is_empty(),
        has_numbers: features.locale.has_numbers,
    }
}

/// Set when dropped. Shared with blocking sub-searches so that work queued
/// after the caller went away is skipped.
struct CancelOnDrop(Arc<AtomicBool>);

impl CancelOnDrop {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Run the three sub-searches concurrently and fuse them.
///
/// Dropping the future aborts the `JoinSet`, but a blocking scan that is
/// already running cannot be interrupted and finishes in the background.
/// Sub-searches that have not started yet see the cancel flag and return
/// nothing.
async fn hybrid_candidates(
    index: &Arc<ComprehensiveIndex>,
    query: &SearchQuery,
    vector: Option<Vec<f32>>,
    filter: Option<Arc<BTreeSet<u32>>>,
    k: usize,
    threshold: Option<f32>,
) -> SearchResult<(FusionConfig, Vec<Candidate>)> {
    let guard = CancelOnDrop::new();
    let mut tasks: JoinSet<SearchResult<(Source, Ranked)>> = JoinSet::new();
    if let Some(vector) = vector {
        let index = Arc::clone(index);
        let filter = filter.clone();
        let cancelled = guard.flag();
        tasks.spawn_blocking(move || {
            if cancelled.load(Ordering::Relaxed) {
                return Ok((Source::Vector, Ranked::new()));
            }
            let hits = index.vector_hits(&vector, k, filter.as_deref(), threshold)?;
            Ok((Source::Vector, hits))
        });
    }
    {
        let index = Arc::clone(index);
        let filter = filter.clone();
        let text = query.text.clone();
        let cancelled = guard.flag();
        tasks.spawn_blocking(move || {
            if cancelled.load(Ordering::Relaxed) {
                return Ok((Source::Semantic, Ranked::new()));
            }
            Ok((Source::Semantic, index.semantic_hits(&text, k, filter.as_deref())))
        });
    }
    {
        let index = Arc::clone(index);
        let text = query.text.clone();
        let cancelled = guard.flag();
        tasks.spawn_blocking(move || {
            if cancelled.load(Ordering::Relaxed) {
                return Ok((Source::Facet, Ranked::new()));
            }
            Ok((Source::Facet, index.facet_hits(&text, k, filter.as_deref())))
        });
    }

    let (mut vector_hits, mut semantic_hits, mut facet_hits) =
        (Ranked::new(), Ranked::new(), Ranked::new());
    while let Some(joined) = tasks.join_next().await {
        match joined?? {
            (Source::Vector, hits) => vector_hits = hits,
            (Source::Semantic, hits) => semantic_hits = hits,
            (Source::Facet, hits) => facet_hits = hits,
        }
    }
    let inputs = FusionInputs {
        vector: &vector_hits,
        semantic: &semantic_hits,
        facet: &facet_hits,
    };

    let fusion = index.fusion().adapted(query_features(index, &query.text));
    let candidates = fusion
        .fuse(&inputs, k)
        .into_iter()
        .map(|hit| Candidate {
            position: hit.position,
            score: hit.score,
            vector_score: hit.vector_score,
            semantic_score: hit.semantic_score,
            facet_score: hit.facet_score,
        })
        .collect();
    Ok((fusion, candidates))
}

fn boost_factor(fragment: &ContentFragment, boosts: &BTreeMap<String, f32>) -> f32 {
    boosts
        .iter()
        .filter(|(key, _)| **key == fragment.kind || fragment.metadata.contains_key(*key))
        .map(|(_, factor)| *factor)
        .product()
}

/// Dedup by fragment id, apply boosts, `min_score` and `limit`.
fn finalize(
    index: &ComprehensiveIndex,
    query: &SearchQuery,
    mut candidates: Vec<Candidate>,
    limit: usize,
    considered: &mut usize,
) -> Vec<SearchHit> {
    if !query.boosts.is_empty() {
        for candidate in &mut candidates {
            if let Some(fragment) = index.fragment(candidate.position) {
                candidate.score *= boost_factor(fragment, &query.boosts);
            }
        }
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.position.cmp(&b.position))
        });
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut hits = Vec::new();
    for candidate in candidates {
        let Some(fragment) = index.fragment(candidate.position) else {
            continue;
        };
        if !seen.insert(fragment.id.as_str()) {
            continue;
        }
        *considered += 1;
        if query.min_score.is_some_and(|min| candidate.score < min) || hits.len() >= limit {
            continue;
        }
        hits.push(SearchHit {
            id: fragment.id.clone(),
            position: candidate.position,
            kind: fragment.kind.clone(),
            text: fragment.text.clone(),
            score: candidate.score,
            sources: candidate.sources(),
            vector_score: candidate.vector_score,
            semantic_score: candidate.semantic_score,
            facet_score: candidate.facet_score,
            metadata: fragment.metadata.clone(),
        });
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::EmbeddingMode;
    use crate::search::facet_index::{FacetConstraint, FacetDimension};

    fn config() -> SearchConfig {
        let mut cfg = SearchConfig::default();
        cfg.embedding.mode = EmbeddingMode::Local;
        cfg.vector.dimension = 64;
        cfg
    }

    fn corpus() -> Vec<ContentFragment> {
        vec![
            ContentFragment::new("f0", "text", "sales rose 15% in Q3"),
            ContentFragment::new("f1", "text", "engineering manager announcement"),
            ContentFragment::new("f2", "table", "system latency improved 30%"),
            ContentFragment::new("f0", "text", "sales duplicate id"),
        ]
    }

    #[tokio::test]
    async fn search_before_build_is_not_ready() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        let err = orchestrator.search(SearchQuery::new("sales")).await.unwrap_err();
        assert!(matches!(err, SearchError::NotReady { component: "index" }));
    }

    #[test]
    fn dropping_the_guard_raises_the_cancel_flag() {
        let guard = CancelOnDrop::new();
        let flag = guard.flag();
        assert!(!flag.load(Ordering::Relaxed));
        drop(guard);
        assert!(flag.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn abandoned_hybrid_search_leaves_orchestrator_usable() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let abandoned = tokio::time::timeout(
            std::time::Duration::ZERO,
            orchestrator.search(SearchQuery::new("sales Q3")),
        )
        .await;
        let response = orchestrator.search(SearchQuery::new("sales Q3")).await.unwrap();
        if let Ok(first) = abandoned {
            assert_eq!(first.unwrap().hits.len(), response.hits.len());
        }
        assert_eq!(response.hits[0].id, "f0");
    }

    #[tokio::test]
    async fn hybrid_results_are_unique_by_id() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let response = orchestrator.search(SearchQuery::new("sales")).await.unwrap();
        let ids: Vec<&str> = response.hits.iter().map(|h| h.id.as_str()).collect();
        let unique: HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(ids.first(), Some(&"f0"));
        let weights = response.weights.unwrap();
        assert!((weights.sum() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn boosts_reorder_by_kind() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let query = SearchQuery::new("improved sales")
            .with_mode(SearchMode::Semantic)
            .with_boost("table", 10.0);
        let response = orchestrator.search(query).await.unwrap();
        assert_eq!(response.hits[0].id, "f2");
    }

    #[tokio::test]
    async fn explicit_filters_are_hard_restrictions() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let query = SearchQuery::new("sales latency")
            .with_filter(FacetConstraint::new(FacetDimension::Categorical, "content_type", ["table"]));
        let response = orchestrator.search(query).await.unwrap();
        assert!(!response.hits.is_empty());
        assert!(response.hits.iter().all(|h| h.kind == "table"));
    }

    #[tokio::test]
    async fn vector_mode_without_embedder_requires_a_vector() {
        let orchestrator = SearchOrchestrator::without_embeddings(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let err = orchestrator
            .search(SearchQuery::new("sales").with_mode(SearchMode::Vector))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::NotReady { component: "vector index" }));

        let semantic = orchestrator
            .search(SearchQuery::new("sales").with_mode(SearchMode::Semantic))
            .await
            .unwrap();
        assert_eq!(semantic.hits[0].id, "f0");
    }

    #[tokio::test]
    async fn min_score_and_limit_cap_results() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let response = orchestrator
            .search(
                SearchQuery::new("sales")
                    .with_mode(SearchMode::Semantic)
                    .with_min_score(0.99)
                    .with_limit(1),
            )
            .await
            .unwrap();
        assert_eq!(response.hits.len(), 1);
        assert!(response.hits[0].score >= 0.99);
    }

    #[tokio::test]
    async fn metrics_track_queries_and_cache_hits() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let query = SearchQuery::new("latency").with_mode(SearchMode::Semantic);
        let first = orchestrator.search(query.clone()).await.unwrap();
        let second = orchestrator.search(query).await.unwrap();
        assert!(!first.cached && second.cached);
        assert_eq!(first.hits, second.hits);
        let metrics = orchestrator.metrics();
        assert_eq!((metrics.queries, metrics.cache_hits), (2, 1));
        assert_eq!(metrics.queries_by_mode.get("semantic"), Some(&2));
        assert_eq!(metrics.last_build.unwrap().fragment_count, 4);
        assert_eq!(orchestrator.cache_stats().query.hits, 1);
    }

    #[tokio::test]
    async fn evaluate_reports_precision_against_ground_truth() {
        let orchestrator = SearchOrchestrator::new(config()).unwrap();
        orchestrator.build_index(corpus(), None).await.unwrap();
        let truth = vec!["f0".to_string()];
        let report = orchestrator
            .evaluate(
                SearchQuery::new("sales").with_mode(SearchMode::Semantic).with_limit(1),
                Some(&truth),
            )
            .await
            .unwrap();
        assert_eq!(report.result_count, 1);
        assert_eq!(report.precision, Some(1.0));
        assert_eq!(report.recall, Some(1.0));
    }
}

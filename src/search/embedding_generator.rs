//! Batch embedding with backend selection and fallback.
//!
//! The generator owns one [`ActiveBackend`] (what the configured mode resolved
//! to at construction) and, for remote mode, an optional per-fragment fallback
//! backend. All fallback decisions happen here; backends only embed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, SearchConfig};
use crate::model::types::{ContentFragment, EmbeddedFragment, EmbeddingMetadata, EmbeddingMode};
use crate::search::cache::EmbeddingCache;
use crate::search::canonicalize::{
    canonicalize_for_embedding, embedding_cache_key, truncate_to_chars,
};
use crate::search::embedder::{
    DisabledEmbedder, Embedder, EmbedderError, EmbedderResult, fit_dimension,
};
use crate::search::embedder_registry::get_local_embedder;
use crate::search::error::{SearchError, SearchResult};
use crate::search::remote_embedder::{RemoteEmbedder, RemoteEmbedderConfig};
use crate::search::text_features::detect_locale;

/// A resolved backend: the mode it serves plus the embedder doing the work.
#[derive(Clone)]
pub struct ActiveBackend {
    pub mode: EmbeddingMode,
    pub embedder: Arc<dyn Embedder>,
}

impl ActiveBackend {
    pub fn new(mode: EmbeddingMode, embedder: Arc<dyn Embedder>) -> Self {
        Self { mode, embedder }
    }

    pub fn disabled(dimension: usize) -> Self {
        Self::new(EmbeddingMode::Disabled, Arc::new(DisabledEmbedder::new(dimension)))
    }

    pub fn id(&self) -> &str {
        self.embedder.id()
    }
}

impl std::fmt::Debug for ActiveBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveBackend")
            .field("mode", &self.mode)
            .field("embedder", &self.embedder.id())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    Embedding,
    VectorIndex,
    SemanticFacet,
    Fusion,
}

impl BuildPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Embedding => "embedding",
            BuildPhase::VectorIndex => "vector_index",
            BuildPhase::SemanticFacet => "semantic_facet",
            BuildPhase::Fusion => "fusion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildProgress {
    pub phase: BuildPhase,
    pub completed: usize,
    pub total: usize,
}

/// Progress callback shared with worker tasks.
pub type ProgressFn = Arc<dyn Fn(BuildProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub fallback_used: usize,
    pub cache_hits: usize,
    /// Calls into a semantic (remote) backend.
    pub external_calls: usize,
    pub elapsed_ms: f64,
    pub avg_ms_per_fragment: f64,
}

#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    /// One entry per input fragment, in input order.
    pub fragments: Vec<EmbeddedFragment>,
    pub metrics: BatchMetrics,
}

#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    failed: bool,
    fallback_used: bool,
    cached: bool,
    external_calls: usize,
}

struct Inner {
    primary: ActiveBackend,
    fallback: Option<ActiveBackend>,
    cache: Arc<EmbeddingCache>,
    dimension: usize,
    locale_optimization: bool,
    locale_boost: f32,
    max_text_chars: usize,
    batch_size: usize,
}

/// Cheap to clone; clones share backends and the cache.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmbeddingGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGenerator")
            .field("primary", &self.inner.primary)
            .field("fallback", &self.inner.fallback)
            .field("dimension", &self.inner.dimension)
            .finish_non_exhaustive()
    }
}

fn init_backend(
    mode: EmbeddingMode,
    config: &EmbeddingConfig,
    dimension: usize,
) -> EmbedderResult<ActiveBackend> {
    let embedder: Arc<dyn Embedder> = match mode {
        EmbeddingMode::Local => get_local_embedder(&config.local_model, dimension, config.device)?,
        EmbeddingMode::Remote => Arc::new(RemoteEmbedder::new(RemoteEmbedderConfig {
            endpoint: config.remote_endpoint.clone(),
            model: config.remote_model.clone(),
            api_key_env: config.api_key_env.clone(),
            timeout: Duration::from_secs(config.remote_timeout_secs),
            retries: config.remote_retries,
            dimension,
        })?),
        EmbeddingMode::Disabled => Arc::new(DisabledEmbedder::new(dimension)),
    };
    Ok(ActiveBackend::new(mode, embedder))
}

/// Resolve the configured mode into a working backend.
///
/// Remote without credentials always demotes to local. Any other failure
/// goes to the fallback mode when enabled, and to disabled otherwise.
fn resolve_primary(config: &EmbeddingConfig, dimension: usize) -> ActiveBackend {
    match init_backend(config.mode, config, dimension) {
        Ok(backend) => backend,
        Err(EmbedderError::MissingCredentials(var)) => {
            warn!(env = %var, "remote embedding credentials missing; using local embeddings");
            init_backend(EmbeddingMode::Local, config, dimension).unwrap_or_else(|err| {
                warn!(error = %err, "local embedder unavailable; embeddings disabled");
                ActiveBackend::disabled(dimension)
            })
        }
        Err(err) if config.fallback_enabled && config.fallback_mode != config.mode => {
            warn!(
                mode = %config.mode,
                fallback = %config.fallback_mode,
                error = %err,
                "embedding backend failed to initialize; falling back"
            );
            init_backend(config.fallback_mode, config, dimension).unwrap_or_else(|err| {
                warn!(error = %err, "fallback embedder unavailable; embeddings disabled");
                ActiveBackend::disabled(dimension)
            })
        }
        Err(err) => {
            warn!(mode = %config.mode, error = %err, "embedding backend unavailable; embeddings disabled");
            ActiveBackend::disabled(dimension)
        }
    }
}

impl EmbeddingGenerator {
    pub fn new(config: &SearchConfig, cache: Arc<EmbeddingCache>) -> Self {
        let emb = &config.embedding;
        let dimension = config.vector.dimension;
        let primary = resolve_primary(emb, dimension);
        let fallback = if primary.mode == EmbeddingMode::Remote && emb.fallback_enabled {
            match init_backend(emb.fallback_mode, emb, dimension) {
                Ok(backend) if backend.mode != EmbeddingMode::Remote => Some(backend),
                Ok(_) => None,
                Err(err) => {
                    warn!(error = %err, "per-fragment fallback backend unavailable");
                    None
                }
            }
        } else {
            None
        };
        info!(
            mode = %primary.mode,
            model = primary.id(),
            fallback = fallback.as_ref().map(|b| b.mode.as_str()),
            dimension,
            "embedding generator ready"
        );
        Self::with_backends(config, primary, fallback, cache)
    }

    /// Build with explicit backends, skipping mode resolution.
    pub fn with_backends(
        config: &SearchConfig,
        primary: ActiveBackend,
        fallback: Option<ActiveBackend>,
        cache: Arc<EmbeddingCache>,
    ) -> Self {
        let emb = &config.embedding;
        Self {
            inner: Arc::new(Inner {
                primary,
                fallback,
                cache,
                dimension: config.vector.dimension,
                locale_optimization: emb.locale_optimization,
                locale_boost: emb.locale_boost,
                max_text_chars: emb.max_text_chars,
                batch_size: emb.batch_size.max(1),
            }),
        }
    }

    pub fn mode(&self) -> EmbeddingMode {
        self.inner.primary.mode
    }

    pub fn model_id(&self) -> &str {
        self.inner.primary.id()
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    pub fn has_fallback(&self) -> bool {
        self.inner.fallback.is_some()
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.inner.cache
    }

    /// Embed every fragment, one output per input in input order.
    ///
    /// Groups of `batch_size` run on the blocking pool, fragments within a
    /// group in parallel. Per-fragment failures never fail the batch; they
    /// yield zero vectors flagged `failed`.
    pub async fn embed_fragments(
        &self,
        fragments: Vec<ContentFragment>,
        progress: Option<ProgressFn>,
    ) -> SearchResult<EmbeddingBatch> {
        let start = Instant::now();
        let total = fragments.len();
        let mut output = Vec::with_capacity(total);
        let mut metrics = BatchMetrics {
            total,
            ..BatchMetrics::default()
        };

        let mut remaining = fragments.into_iter().peekable();
        while remaining.peek().is_some() {
            let group: Vec<ContentFragment> =
                remaining.by_ref().take(self.inner.batch_size).collect();
            let inner = Arc::clone(&self.inner);
            let embedded = tokio::task::spawn_blocking(move || {
                group
                    .into_par_iter()
                    .map(|fragment| inner.embed_fragment(fragment))
                    .collect::<Vec<_>>()
            })
            .await?;

            for (fragment, outcome) in embedded {
                if outcome.failed {
                    metrics.failed += 1;
                } else {
                    metrics.succeeded += 1;
                }
                metrics.fallback_used += usize::from(outcome.fallback_used);
                metrics.cache_hits += usize::from(outcome.cached);
                metrics.external_calls += outcome.external_calls;
                output.push(fragment);
            }
            if let Some(progress) = &progress {
                progress(BuildProgress {
                    phase: BuildPhase::Embedding,
                    completed: output.len(),
                    total,
                });
            }
        }

        metrics.elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics.avg_ms_per_fragment = if total == 0 {
            0.0
        } else {
            metrics.elapsed_ms / total as f64
        };
        if metrics.failed > 0 {
            warn!(failed = metrics.failed, total, "some fragments could not be embedded");
        }
        debug!(
            total,
            cache_hits = metrics.cache_hits,
            fallback_used = metrics.fallback_used,
            elapsed_ms = metrics.elapsed_ms,
            "embedding batch complete"
        );
        Ok(EmbeddingBatch {
            fragments: output,
            metrics,
        })
    }

    /// Embed a query string through the same canonicalize/cache/fallback path.
    pub async fn embed_query(&self, text: &str) -> SearchResult<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        let (vector, outcome) = tokio::task::spawn_blocking(move || inner.embed_text(&text)).await?;
        if outcome.failed {
            return Err(SearchError::Embedding(
                "query text could not be embedded".to_string(),
            ));
        }
        Ok(vector)
    }
}

impl Inner {
    fn embed_fragment(&self, fragment: ContentFragment) -> (EmbeddedFragment, Outcome) {
        let (vector, outcome) = self.embed_text(&fragment.text);
        let locale_optimized = self.locale_optimization;
        let has_japanese = locale_optimized && detect_locale(&fragment.text).has_japanese;
        let boost = if has_japanese {
            fragment.weight * self.locale_boost
        } else {
            fragment.weight
        };
        let backend = if outcome.fallback_used {
            self.fallback.as_ref().unwrap_or(&self.primary)
        } else {
            &self.primary
        };
        let metadata = EmbeddingMetadata {
            backend: backend.mode,
            model_id: backend.id().to_string(),
            locale_optimized,
            fallback_used: outcome.fallback_used,
            cached: outcome.cached,
            failed: outcome.failed,
        };
        (
            EmbeddedFragment {
                fragment,
                vector,
                metadata,
                boost,
            },
            outcome,
        )
    }

    fn embed_text(&self, text: &str) -> (Vec<f32>, Outcome) {
        let canonical = if self.locale_optimization {
            canonicalize_for_embedding(text, true, self.max_text_chars)
        } else {
            truncate_to_chars(text, self.max_text_chars)
        };
        let mut outcome = Outcome::default();

        match self.embed_with(&self.primary, &canonical, &mut outcome) {
            Ok(vector) => return (vector, outcome),
            Err(err) => debug!(backend = %self.primary.mode, error = %err, "primary embedding failed"),
        }
        if let Some(fallback) = &self.fallback {
            match self.embed_with(fallback, &canonical, &mut outcome) {
                Ok(vector) => {
                    outcome.fallback_used = true;
                    return (vector, outcome);
                }
                Err(err) => debug!(backend = %fallback.mode, error = %err, "fallback embedding failed"),
            }
        }
        outcome.failed = true;
        (vec![0.0; self.dimension], outcome)
    }

    fn embed_with(
        &self,
        backend: &ActiveBackend,
        canonical: &str,
        outcome: &mut Outcome,
    ) -> EmbedderResult<Vec<f32>> {
        let key = embedding_cache_key(canonical, backend.id());
        if let Some(vector) = self.cache.get(&key) {
            outcome.cached = true;
            return Ok(vector.to_vec());
        }
        if backend.embedder.is_semantic() {
            outcome.external_calls += 1;
        }
        let vector = fit_dimension(backend.embedder.embed(canonical)?, self.dimension);
        if backend.mode != EmbeddingMode::Disabled {
            self.cache.insert(key, &vector);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::search::hash_embedder::HashEmbedder;

    struct FailingEmbedder;

    impl Embedder for FailingEmbedder {
        fn embed(&self, _text: &str) -> EmbedderResult<Vec<f32>> {
            Err(EmbedderError::Timeout(Duration::from_millis(1)))
        }

        fn dimension(&self) -> usize {
            16
        }

        fn id(&self) -> &str {
            "always-fails"
        }

        fn is_semantic(&self) -> bool {
            true
        }
    }

    fn config(mode: EmbeddingMode) -> SearchConfig {
        let mut cfg = SearchConfig::default();
        cfg.embedding.mode = mode;
        cfg.embedding.batch_size = 3;
        cfg.vector.dimension = 16;
        cfg
    }

    fn corpus(n: usize) -> Vec<ContentFragment> {
        (0..n)
            .map(|i| ContentFragment::new(format!("f{i}"), "text", format!("fragment number {i}")))
            .collect()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn local_mode_preserves_order_and_dimension() {
        let cfg = config(EmbeddingMode::Local);
        let generator = EmbeddingGenerator::new(&cfg, Arc::new(EmbeddingCache::new(true, 100)));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let progress: ProgressFn = Arc::new(move |p: BuildProgress| {
            assert_eq!(p.phase, BuildPhase::Embedding);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let batch = runtime()
            .block_on(generator.embed_fragments(corpus(7), Some(progress)))
            .unwrap();
        let ids: Vec<&str> = batch.fragments.iter().map(|f| f.fragment.id.as_str()).collect();
        assert_eq!(ids, ["f0", "f1", "f2", "f3", "f4", "f5", "f6"]);
        assert!(batch.fragments.iter().all(|f| f.vector.len() == 16));
        assert_eq!(batch.metrics.succeeded, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn second_batch_is_served_from_cache() {
        let cfg = config(EmbeddingMode::Local);
        let generator = EmbeddingGenerator::new(&cfg, Arc::new(EmbeddingCache::new(true, 100)));
        let rt = runtime();
        let first = rt.block_on(generator.embed_fragments(corpus(4), None)).unwrap();
        let second = rt.block_on(generator.embed_fragments(corpus(4), None)).unwrap();
        assert_eq!(first.metrics.cache_hits, 0);
        assert_eq!(second.metrics.cache_hits, 4);
        assert!(second.fragments.iter().all(|f| f.metadata.cached));
        assert_eq!(first.fragments[2].vector, second.fragments[2].vector);
    }

    #[test]
    fn remote_without_credentials_demotes_to_local() {
        let mut cfg = config(EmbeddingMode::Remote);
        cfg.embedding.api_key_env = "MMSEARCH_TEST_UNSET_REMOTE_KEY".to_string();
        cfg.embedding.fallback_enabled = false;
        let generator = EmbeddingGenerator::new(&cfg, Arc::new(EmbeddingCache::disabled()));
        assert_eq!(generator.mode(), EmbeddingMode::Local);
    }

    #[test]
    fn unknown_local_model_without_fallback_disables() {
        let mut cfg = config(EmbeddingMode::Local);
        cfg.embedding.local_model = "not-a-model".to_string();
        cfg.embedding.fallback_enabled = false;
        let generator = EmbeddingGenerator::new(&cfg, Arc::new(EmbeddingCache::disabled()));
        assert_eq!(generator.mode(), EmbeddingMode::Disabled);
    }

    #[test]
    fn failing_remote_recovers_through_fallback() {
        let cfg = config(EmbeddingMode::Remote);
        let generator = EmbeddingGenerator::with_backends(
            &cfg,
            ActiveBackend::new(EmbeddingMode::Remote, Arc::new(FailingEmbedder)),
            Some(ActiveBackend::new(EmbeddingMode::Local, Arc::new(HashEmbedder::new(16)))),
            Arc::new(EmbeddingCache::new(true, 100)),
        );
        let batch = runtime().block_on(generator.embed_fragments(corpus(5), None)).unwrap();
        assert_eq!(batch.metrics.fallback_used, 5);
        assert_eq!(batch.metrics.failed, 0);
        assert_eq!(batch.metrics.external_calls, 5);
        assert!(batch.fragments.iter().all(|f| f.metadata.backend == EmbeddingMode::Local));
    }

    #[test]
    fn unrecovered_failures_yield_flagged_zero_vectors() {
        let cfg = config(EmbeddingMode::Remote);
        let generator = EmbeddingGenerator::with_backends(
            &cfg,
            ActiveBackend::new(EmbeddingMode::Remote, Arc::new(FailingEmbedder)),
            None,
            Arc::new(EmbeddingCache::disabled()),
        );
        let rt = runtime();
        let batch = rt.block_on(generator.embed_fragments(corpus(2), None)).unwrap();
        assert_eq!(batch.metrics.failed, 2);
        assert!(batch.fragments.iter().all(|f| f.metadata.failed));
        assert!(batch.fragments[0].vector.iter().all(|v| *v == 0.0));
        assert!(rt.block_on(generator.embed_query("sales")).is_err());
    }

    #[test]
    fn japanese_fragments_get_locale_boost() {
        let cfg = config(EmbeddingMode::Disabled);
        let generator = EmbeddingGenerator::new(&cfg, Arc::new(EmbeddingCache::disabled()));
        let fragments = vec![
            ContentFragment::new("ja", "text", "売上高が増加").with_weight(2.0),
            ContentFragment::new("en", "text", "revenue grew").with_weight(2.0),
        ];
        let batch = runtime().block_on(generator.embed_fragments(fragments, None)).unwrap();
        assert!((batch.fragments[0].boost - 2.2).abs() < 1e-6);
        assert_eq!(batch.fragments[1].boost, 2.0);
        assert!(batch.fragments.iter().all(|f| f.vector.iter().all(|v| *v == 0.0)));
    }
}

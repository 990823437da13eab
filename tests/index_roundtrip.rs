mod util;

use anyhow::Result;
use multimodal_search::config::SearchConfig;
use multimodal_search::model::types::EmbeddingMode;
use multimodal_search::search::orchestrator::SearchOrchestrator;
use multimodal_search::search::query::{SearchMode, SearchQuery, SearchResponse};
use multimodal_search::search::vector_index::Quantization;
use multimodal_search::storage::index_store::{IndexStore, StoreError, VECTORS_FILE};
use tempfile::tempdir;
use util::{report_corpus, test_config};

fn queries() -> Vec<SearchQuery> {
    let mut out = Vec::new();
    for text in ["売上 Q3", "engineering manager", "latency 30%", "revenue"] {
        for mode in SearchMode::ALL {
            out.push(SearchQuery::new(text).with_mode(mode).with_limit(5));
        }
    }
    out
}

fn assert_same_results(a: &SearchResponse, b: &SearchResponse) {
    let ids_a: Vec<&str> = a.hits.iter().map(|h| h.id.as_str()).collect();
    let ids_b: Vec<&str> = b.hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(ids_a, ids_b, "query `{}` ({})", a.query, a.mode);
    for (x, y) in a.hits.iter().zip(&b.hits) {
        assert!(
            (x.score - y.score).abs() <= 1e-6,
            "score drift for {}: {} vs {}",
            x.id,
            x.score,
            y.score
        );
    }
}

async fn roundtrip(config: SearchConfig) -> Result<()> {
    let dir = tempdir()?;
    let original = SearchOrchestrator::new(config.clone())?;
    let built = original.build_index(report_corpus(), None).await?;
    let store = IndexStore::new(dir.path().join("idx"));
    store.save(&built)?;
    assert!(store.exists());

    let loaded = store.load()?;
    assert_eq!(loaded.len(), built.len());
    assert_eq!(loaded.stats(), built.stats());
    assert_eq!(loaded.created_at(), built.created_at());
    assert_eq!(
        loaded.vector().map(|v| v.uses_ann()),
        built.vector().map(|v| v.uses_ann())
    );

    let reloaded = SearchOrchestrator::from_index(config, loaded)?;
    for query in queries() {
        let expected = original.search(query.clone()).await?;
        let actual = reloaded.search(query).await?;
        assert_same_results(&expected, &actual);
    }
    Ok(())
}

#[tokio::test]
async fn save_load_query_is_identical() -> Result<()> {
    roundtrip(test_config(EmbeddingMode::Local)).await
}

#[tokio::test]
async fn f16_vectors_round_trip() -> Result<()> {
    let mut config = test_config(EmbeddingMode::Local);
    config.vector.quantization = Quantization::F16;
    roundtrip(config).await
}

#[tokio::test]
async fn ann_graph_is_rebuilt_on_load() -> Result<()> {
    let mut config = test_config(EmbeddingMode::Local);
    config.vector.ann_threshold = 2;
    roundtrip(config).await
}

#[tokio::test]
async fn index_without_vectors_drops_stale_vector_file() -> Result<()> {
    let dir = tempdir()?;
    let store = IndexStore::new(dir.path());

    let with_vectors = SearchOrchestrator::new(test_config(EmbeddingMode::Local))?;
    store.save(&*with_vectors.build_index(report_corpus(), None).await?)?;
    assert!(dir.path().join(VECTORS_FILE).exists());

    let without = SearchOrchestrator::without_embeddings(test_config(EmbeddingMode::Local))?;
    store.save(&*without.build_index(report_corpus(), None).await?)?;
    assert!(!dir.path().join(VECTORS_FILE).exists());

    let loaded = store.load()?;
    assert!(loaded.vector().is_none());
    assert_eq!(loaded.len(), 6);
    Ok(())
}

#[tokio::test]
async fn truncated_vector_file_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = IndexStore::new(dir.path());
    let orchestrator = SearchOrchestrator::new(test_config(EmbeddingMode::Local))?;
    store.save(&*orchestrator.build_index(report_corpus(), None).await?)?;

    let path = dir.path().join(VECTORS_FILE);
    let bytes = std::fs::read(&path)?;
    std::fs::write(&path, &bytes[..bytes.len() / 2])?;
    assert!(matches!(store.load(), Err(StoreError::Vector(_))));

    std::fs::remove_file(&path)?;
    assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    Ok(())
}

#[tokio::test]
async fn embedding_cache_persists_across_orchestrators() -> Result<()> {
    let dir = tempdir()?;
    let mut config = test_config(EmbeddingMode::Local);
    config.cache.dir = Some(dir.path().to_path_buf());

    let first = SearchOrchestrator::new(config.clone())?;
    first.build_index(report_corpus(), None).await?;
    assert!(first.cache_stats().embedding.entries >= 6);

    let second = SearchOrchestrator::new(config)?;
    let index = second.build_index(report_corpus(), None).await?;
    assert_eq!(index.stats().cache_hits, 6);
    Ok(())
}

//! Errors surfaced by the orchestrator.

use crate::config::ConfigError;

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The index, or the named part of it, has not been built or loaded.
    #[error("index not ready: {component} is not available")]
    NotReady { component: &'static str },
    #[error("vector search needs a query vector, and no embedding backend can produce one")]
    QueryVectorRequired,
    #[error("query vector has dimension {actual}, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// A batch-level embedding task failed (not a per-fragment failure).
    #[error("embedding task failed: {0}")]
    Embedding(String),
    #[error("index error: {0:#}")]
    Index(anyhow::Error),
}

impl SearchError {
    pub fn not_ready(component: &'static str) -> Self {
        SearchError::NotReady { component }
    }
}

impl From<tokio::task::JoinError> for SearchError {
    fn from(err: tokio::task::JoinError) -> Self {
        SearchError::Embedding(err.to_string())
    }
}

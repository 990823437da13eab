//! Search layer facade.
//!
//! - **[`text_features`]**: keyword, business-term and locale extraction.
//! - **[`embedder`]**: embedder trait plus the disabled backend.
//! - **[`hash_embedder`]** / **[`remote_embedder`]**: local and HTTP backends.
//! - **[`embedder_registry`]**: local model lookup by name.
//! - **[`embedding_generator`]**: batch embedding with mode fallback.
//! - **[`cache`]**: embedding and query-result caches.
//! - **[`vector_index`]** / **[`ann_index`]**: FVIX matrix, exact and HNSW search.
//! - **[`semantic_index`]** / **[`facet_index`]**: inverted term and facet indices.
//! - **[`fusion`]**: rank/score fusion and quality evaluation.
//! - **[`orchestrator`]**: index builds and query execution.

pub mod ann_index;
pub mod cache;
pub mod canonicalize;
pub mod embedder;
pub mod embedder_registry;
pub mod embedding_generator;
pub mod error;
pub mod facet_index;
pub mod fusion;
pub mod hash_embedder;
pub mod index;
pub mod orchestrator;
pub mod query;
pub mod remote_embedder;
pub mod semantic_index;
pub mod text_features;
pub mod vector_index;

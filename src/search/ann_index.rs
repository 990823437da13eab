//! HNSW approximate nearest neighbor graph over the vector slab.
//!
//! The graph is an acceleration structure only: [`crate::search::vector_index`]
//! builds it once the corpus reaches the configured ANN threshold, uses it to
//! shortlist candidates and then re-scores those candidates exactly. It is not
//! persisted; loading a saved index rebuilds it from the raw matrix.
//!
//! ## Parameters
//!
//! - M (max_nb_connection): 16 by default, balances memory and recall
//! - ef_construction: 200 by default
//! - ef_search: 100 by default, raised to the candidate count when larger
//!
//! Embeddings are unit length, so Euclidean order equals inner-product order
//! and `DistL2` is used as the graph metric.

use anyhow::{Result, bail};
use hnsw_rs::hnsw::{Hnsw, Neighbour};
use hnsw_rs::prelude::*;

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
pub const DEFAULT_EF_SEARCH: usize = 100;
pub const DEFAULT_MAX_LAYER: usize = 16;

/// One candidate from the graph.
#[derive(Debug, Clone)]
pub struct AnnCandidate {
    /// Row index in the owning vector index.
    pub row_idx: usize,
    /// Euclidean distance to the query (lower is closer).
    pub distance: f32,
}

pub struct HnswIndex {
    hnsw: Hnsw<'static, f32, DistL2>,
    count: usize,
    dimension: usize,
}

impl HnswIndex {
    /// Build the graph over `vectors`; the position in the slice is the row id.
    pub fn build(
        vectors: &[Vec<f32>],
        dimension: usize,
        m: usize,
        ef_construction: usize,
    ) -> Result<Self> {
        let count = vectors.len();
        if count == 0 {
            bail!("cannot build HNSW graph from an empty vector set");
        }
        if let Some((idx, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dimension) {
            bail!(
                "vector {idx} has dimension {}, expected {dimension}",
                v.len()
            );
        }

        tracing::info!(count, dimension, m, ef_construction, "building HNSW graph");

        let hnsw: Hnsw<f32, DistL2> =
            Hnsw::new(m, count, DEFAULT_MAX_LAYER, ef_construction, DistL2);
        let with_ids: Vec<(&[f32], usize)> = vectors
            .iter()
            .enumerate()
            .map(|(idx, v)| (v.as_slice(), idx))
            .collect();
        hnsw.parallel_insert_slice(&with_ids);

        tracing::debug!(count, "HNSW graph built");
        Ok(Self {
            hnsw,
            count,
            dimension,
        })
    }

    /// Up to `k` candidates, nearest first.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<AnnCandidate>> {
        if query.len() != self.dimension {
            bail!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            );
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let neighbours: Vec<Neighbour> = self.hnsw.search(query, k, ef.max(k));
        Ok(neighbours
            .into_iter()
            .filter(|n| n.d_id < self.count)
            .map(|n| AnnCandidate {
                row_idx: n.d_id,
                distance: n.distance,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("count", &self.count)
            .field("dimension", &self.dimension)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot % dim] = 1.0;
        v
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(HnswIndex::build(&[], 4, DEFAULT_M, DEFAULT_EF_CONSTRUCTION).is_err());
    }

    #[test]
    fn finds_exact_match_first() -> Result<()> {
        let vectors: Vec<Vec<f32>> = (0..8).map(|i| unit(8, i)).collect();
        let index = HnswIndex::build(&vectors, 8, DEFAULT_M, DEFAULT_EF_CONSTRUCTION)?;
        assert_eq!(index.len(), 8);
        let hits = index.search(&unit(8, 5), 3, DEFAULT_EF_SEARCH)?;
        assert_eq!(hits[0].row_idx, 5);
        assert!(hits[0].distance.abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn dimension_mismatch_is_an_error() -> Result<()> {
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        let index = HnswIndex::build(&vectors, 4, DEFAULT_M, DEFAULT_EF_CONSTRUCTION)?;
        assert!(index.search(&[1.0, 0.0], 1, DEFAULT_EF_SEARCH).is_err());
        Ok(())
    }
}

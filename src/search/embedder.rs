//! Embedding backend capability.
//!
//! Every backend (hash, remote HTTP, disabled) implements [`Embedder`]. The
//! embedding generator decides which one runs and how failures fall back;
//! backends only compute vectors.

use std::time::Duration;

pub type EmbedderResult<T> = Result<T, EmbedderError>;

#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),
}

pub trait Embedder: Send + Sync {
    /// Embed one text. Implementations return vectors of [`Self::dimension`] length.
    fn embed(&self, text: &str) -> EmbedderResult<Vec<f32>>;

    fn dimension(&self) -> usize;

    /// Stable identifier, part of the embedding cache key.
    fn id(&self) -> &str;

    /// Whether vectors carry learned semantics (remote models) or only lexical
    /// overlap (hashing).
    fn is_semantic(&self) -> bool;
}

/// Always-available backend producing zero vectors. Never fails, never does I/O.
#[derive(Debug, Clone)]
pub struct DisabledEmbedder {
    dimension: usize,
}

pub const DISABLED_EMBEDDER_ID: &str = "disabled";

impl DisabledEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for DisabledEmbedder {
    fn embed(&self, _text: &str) -> EmbedderResult<Vec<f32>> {
        Ok(vec![0.0; self.dimension])
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        DISABLED_EMBEDDER_ID
    }

    fn is_semantic(&self) -> bool {
        false
    }
}

/// Scale to unit length. Zero vectors are left untouched.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Force `vector` to `dimension` components.
///
/// Longer vectors are truncated and renormalized (Matryoshka-style), shorter
/// ones are zero-padded. Backends with a different native size can then share
/// one index.
pub fn fit_dimension(mut vector: Vec<f32>, dimension: usize) -> Vec<f32> {
    use std::cmp::Ordering;
    match vector.len().cmp(&dimension) {
        Ordering::Equal => vector,
        Ordering::Greater => {
            vector.truncate(dimension);
            l2_normalize(&mut vector);
            vector
        }
        Ordering::Less => {
            vector.resize(dimension, 0.0);
            vector
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_embedder_returns_zeros() {
        let embedder = DisabledEmbedder::new(8);
        let v = embedder.embed("anything").unwrap();
        assert_eq!(v, vec![0.0; 8]);
        assert_eq!(embedder.id(), DISABLED_EMBEDDER_ID);
    }

    #[test]
    fn fit_dimension_truncates_and_renormalizes() {
        let v = fit_dimension(vec![3.0, 4.0, 12.0], 2);
        assert_eq!(v.len(), 2);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn fit_dimension_pads_with_zeros() {
        assert_eq!(fit_dimension(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn l2_normalize_ignores_zero_vector() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }
}

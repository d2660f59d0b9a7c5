//! Similarity index abstraction.
//!
//! The memory service only talks to [`SimilarityIndex`], so exact, tree or
//! graph backends can be swapped in without touching it.

mod codec;
mod flat;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

pub use flat::FlatIndex;

use crate::types::NumericId;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index file corrupt: {0}")]
    Corrupt(String),
    #[error("dimension mismatch: index holds {expected}-d vectors, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("cannot index a zero-norm vector")]
    ZeroVector,
    #[error("backend does not support removing individual vectors")]
    RemoveUnsupported,
}

/// Result of [`SimilarityIndex::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No persisted file; the index is empty.
    Missing,
    Loaded { entries: usize },
}

/// k-nearest-neighbour index keyed by [`NumericId`].
///
/// Scores are inner products; callers pass L2-normalized vectors (see
/// [`normalize`]) so the score equals cosine similarity.
pub trait SimilarityIndex: Send + Sync {
    fn dimension(&self) -> Option<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: NumericId) -> bool;

    fn ids(&self) -> Vec<NumericId>;

    /// Stored vector for `id`, if present.
    fn vector(&self, id: NumericId) -> Option<Vec<f32>>;

    /// Insert `vector` under `id`, replacing any vector already stored for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the vector dimension differs from the index dimension.
    fn add(&self, id: NumericId, vector: Vec<f32>) -> Result<(), IndexError>;

    /// Remove the vector for `id`. Returns `Ok(false)` if it was not present.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::RemoveUnsupported`] for append-only backends.
    fn remove(&self, id: NumericId) -> Result<bool, IndexError>;

    /// Up to `k` entries ranked by descending score.
    ///
    /// # Errors
    ///
    /// Returns an error if the query dimension differs from the index dimension.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(NumericId, f32)>, IndexError>;

    fn clear(&self);

    /// Replace the whole content of the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the entries do not share one dimension.
    fn replace_all(&self, entries: Vec<(NumericId, Vec<f32>)>) -> Result<(), IndexError>;

    /// Write the index to `path`, atomically replacing any previous file.
    fn persist<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<(), IndexError>>;

    /// Replace the in-memory content with the file at `path`.
    ///
    /// On error the in-memory content is left untouched.
    fn load<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<LoadOutcome, IndexError>>;
}

/// L2-normalize `vector` in place.
///
/// # Errors
///
/// Returns [`IndexError::ZeroVector`] if the vector has zero (or non-finite) norm.
pub fn normalize(vector: &mut [f32]) -> Result<(), IndexError> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(IndexError::ZeroVector);
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    Ok(())
}

pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

//! Test-only deterministic embedder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Deterministic embedder for tests.
///
/// Texts registered with [`MockEmbedder::with_vector`] map to their fixed
/// vector. Everything else is embedded as a hashed bag of words, so texts
/// that share tokens land close to each other.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
    fixed: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            fixed: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Pin `text` to `vector`. The vector is resized to the embedder dimension.
    #[must_use]
    pub fn with_vector(self, text: &str, vector: Vec<f32>) -> Self {
        self.set_vector(text, vector);
        self
    }

    pub fn set_vector(&self, text: &str, mut vector: Vec<f32>) {
        vector.resize(self.dimension, 0.0);
        if let Ok(mut fixed) = self.fixed.lock() {
            fixed.insert(text.to_owned(), vector);
        }
    }

    /// Make every subsequent `embed` call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `embed` calls made so far, including failed ones.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn hashed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(&token.to_lowercase());
            #[allow(clippy::cast_possible_truncation)]
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        // Blank text or tokens that cancel out; never hand back a zero vector.
        if vector.iter().all(|v| *v == 0.0) {
            vector[0] = 1.0;
        }
        vector
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LlmError::Other("mock embedding error".into()));
        }
        let pinned = self
            .fixed
            .lock()
            .map_err(|e| LlmError::Other(e.to_string()))?
            .get(text)
            .cloned();
        Ok(pinned.unwrap_or_else(|| self.hashed(text)))
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn model(&self) -> &str {
        "mock-embedding"
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}

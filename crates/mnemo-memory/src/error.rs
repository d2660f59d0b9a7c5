use crate::types::NumericId;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("similarity index error: {0}")]
    Index(#[from] crate::index::IndexError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] mnemo_llm::LlmError),

    #[error("record content must not be empty")]
    EmptyContent,

    #[error("stored embedding for numeric id {numeric_id} is malformed")]
    CorruptEmbedding { numeric_id: NumericId },

    #[error("index and catalogue diverged for numeric id {numeric_id}; run rebuild")]
    Inconsistent { numeric_id: NumericId },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integer conversion: {0}")]
    IntConversion(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Other(String),
}

impl MemoryError {
    /// Whether retrying the same call may succeed without operator action.
    ///
    /// Embedding failures abort before any mutation, so they are always safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Embedding(_))
    }
}

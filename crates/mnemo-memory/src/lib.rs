//! Vector-indexed memory store: a similarity index kept consistent with a
//! durable `SQLite` metadata catalogue.

pub mod error;
pub mod index;
pub mod service;
pub mod sqlite;
pub mod types;

pub use error::MemoryError;
pub use index::{FlatIndex, IndexError, LoadOutcome, SimilarityIndex};
pub use service::{IndexStatus, MemoryOptions, MemoryService, MemoryStats, ReconcileReport};
pub use sqlite::SqliteCatalogue;
pub use types::{AddOutcome, AddStatus, MemoryHit, NewRecord, NumericId, StoredRecord};

//! Vector index facade and bounded embedding cache.
//!
//! [`ChunkIndex`] hides whether chunk records live in Qdrant or in the
//! in-process fallback store; [`EmbeddingCache`] keeps content-addressed
//! vectors so unchanged chunks never hit the embedding backend twice.

pub mod cache;
pub mod chunk_index;
pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod vector_store;

pub use cache::{
    CacheEntry, CacheError, CachePolicy, CacheStats, Clock, EmbeddingCache, EvictionPolicy,
    LeastRecentlyAccessed, ManualClock, SystemClock,
};
pub use chunk_index::{ChunkIndex, IndexRecord, SearchCandidate, point_id};
pub use error::MemoryError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use vector_store::{
    FieldCondition, FieldValue, PayloadPoint, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError,
};

/// Rough token count: four characters per token, scaled by `buffer_factor`
/// and rounded up.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn estimate_tokens(text: &str, buffer_factor: f32) -> usize {
    let chars = text.chars().count() as f64;
    (chars / 4.0 * f64::from(buffer_factor.max(0.0))).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("", 1.0), 0);
        assert_eq!(estimate_tokens("abc", 1.0), 1);
        assert_eq!(estimate_tokens("abcd", 1.0), 1);
        assert_eq!(estimate_tokens("abcde", 1.0), 2);
    }

    #[test]
    fn estimate_tokens_applies_buffer() {
        assert_eq!(estimate_tokens("abcd", 1.5), 2);
        assert_eq!(estimate_tokens("abcdefgh", 1.5), 3);
        assert_eq!(estimate_tokens("abcd", 0.0), 0);
    }

    #[test]
    fn estimate_tokens_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("ééééé", 1.0), 2);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("vector store error: {0}")]
    VectorStore(#[from] crate::vector_store::VectorStoreError),

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("integer conversion: {0}")]
    IntConversion(#[from] std::num::TryFromIntError),

    #[error("malformed record {id}: missing {field}")]
    MalformedRecord { id: String, field: &'static str },

    #[error("{0}")]
    Other(String),
}

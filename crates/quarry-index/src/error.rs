//! Error types for quarry-index.

use std::path::PathBuf;

use crate::indexer::BatchReport;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Reading a changed file failed.
    #[error("read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The extractor rejected a file.
    #[error("extract {path}: {reason}")]
    Extraction { path: String, reason: String },

    #[error("embedding backend: {0}")]
    Embedding(#[from] quarry_llm::LlmError),

    #[error("vector backend: {0}")]
    VectorBackend(#[from] quarry_memory::MemoryError),

    /// Cache snapshot could not be decoded. Logged, never fatal.
    #[error("cache corruption: {0}")]
    CacheCorruption(#[from] quarry_memory::CacheError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Batch stopped early; `report` holds everything completed before the stop.
    #[error("batch aborted: {reason}")]
    Aborted {
        reason: String,
        report: Box<BatchReport>,
    },
}

impl IndexError {
    /// Whether this error stops a batch even in lenient mode.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::VectorBackend(_) | Self::Aborted { .. })
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

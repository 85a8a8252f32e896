//! Incremental chunk indexing and hybrid retrieval.
//!
//! Changed files are split into chunks, reconciled against what the index
//! already holds by content digest, and only the difference is embedded and
//! written. Queries combine vector similarity with keyword overlap and are
//! trimmed to a token budget.

pub mod chunk;
pub mod embedder;
pub mod error;
pub mod extract;
pub(crate) mod hash;
pub mod indexer;
pub mod ranker;
pub mod reconcile;
pub mod retriever;

pub use chunk::{ChangeStatus, Chunk, FileChange};
pub use embedder::CachedEmbedder;
pub use error::{IndexError, Result};
pub use extract::{BlockExtractor, ChunkExtractor, detect_language};
pub use hash::content_hash;
pub use indexer::{BatchOptions, BatchOrchestrator, BatchReport};
pub use ranker::{BudgetWarning, RankerConfig, ScoredChunk, TokenBudget};
pub use reconcile::{ReconciliationResult, reconcile};
pub use retriever::{HybridRetriever, QueryFilters, RetrievalQuery, RetrievalResult, format_as_context};

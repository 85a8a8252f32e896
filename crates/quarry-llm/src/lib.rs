//! Embedding backend abstraction, HTTP backends, and the shared retry policy.

pub mod any;
pub mod error;
pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;

pub use error::LlmError;
pub use provider::EmbeddingProvider;
pub use retry::{RetryPolicy, Retryable, with_retry};

use std::future::Future;

use crate::error::LlmError;

/// A backend that turns text into embedding vectors.
///
/// Implementations must be idempotent: identical input under the same model
/// yields the same vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unreachable or the response is invalid.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, LlmError>> + Send;

    /// Embed several texts, preserving input order.
    ///
    /// The default implementation calls [`Self::embed`] sequentially.
    ///
    /// # Errors
    ///
    /// Returns the first backend error encountered.
    fn embed_batch(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, LlmError>> + Send {
        async move {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }
    }

    /// Embedding model identifier recorded alongside cached vectors.
    fn model(&self) -> &str;

    fn name(&self) -> &str;
}

/// Reject a batch response whose length differs from the request.
pub(crate) fn exact_batch(
    requested: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, LlmError> {
    if vectors.len() == requested {
        Ok(vectors)
    } else {
        Err(LlmError::BatchMismatch {
            expected: requested,
            got: vectors.len(),
        })
    }
}

pub(crate) fn single(provider: &str, vectors: Vec<Vec<f32>>) -> Result<Vec<f32>, LlmError> {
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::EmptyResponse {
            provider: provider.to_owned(),
        })
}

//! Cache-first embedding: only digests missing from the cache reach the backend.

use std::collections::HashMap;
use std::sync::Arc;

use quarry_llm::{EmbeddingProvider, LlmError, RetryPolicy, with_retry};
use quarry_memory::EmbeddingCache;

use crate::hash::content_hash;

pub struct CachedEmbedder<P> {
    provider: Arc<P>,
    cache: Arc<EmbeddingCache>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<P> std::fmt::Debug for CachedEmbedder<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEmbedder")
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Vectors for one request plus how they were obtained.
#[derive(Debug, Default)]
pub struct Embedded {
    pub vectors: Vec<Vec<f32>>,
    pub cache_hits: usize,
    pub generated: usize,
}

impl<P: EmbeddingProvider> CachedEmbedder<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        cache: Arc<EmbeddingCache>,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            cache,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    #[must_use]
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Embed `(digest, text)` pairs, preserving order.
    ///
    /// # Errors
    ///
    /// Returns the backend error once retries are exhausted.
    pub async fn embed(&self, items: &[(&str, &str)]) -> Result<Embedded, LlmError> {
        self.embed_batched(items, self.batch_size).await
    }

    /// Like [`embed`](Self::embed) with an explicit request size. Cache misses
    /// are deduplicated by digest and sent `batch_size` at a time, each request
    /// under the retry policy.
    ///
    /// # Errors
    ///
    /// Returns the backend error once retries are exhausted.
    pub async fn embed_batched(
        &self,
        items: &[(&str, &str)],
        batch_size: usize,
    ) -> Result<Embedded, LlmError> {
        let model = self.provider.model().to_owned();
        let mut found: HashMap<&str, Vec<f32>> = HashMap::new();
        let mut missing: Vec<(&str, &str)> = Vec::new();
        let mut cache_hits = 0usize;

        for &(key, text) in items {
            if found.contains_key(key) || missing.iter().any(|(k, _)| *k == key) {
                continue;
            }
            match self.cache.get_for_model(key, &model) {
                Some(v) => {
                    cache_hits += 1;
                    found.insert(key, v);
                }
                None => missing.push((key, text)),
            }
        }

        let generated = missing.len();
        for batch in missing.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| (*t).to_owned()).collect();
            let vectors = with_retry(&self.retry, "embed_batch", || {
                self.provider.embed_batch(&texts)
            })
            .await?;
            if vectors.len() != batch.len() {
                return Err(LlmError::BatchMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            for (&(key, _), vector) in batch.iter().zip(vectors) {
                self.cache.insert(key, vector.clone(), &model);
                found.insert(key, vector);
            }
        }
        if generated > 0 {
            tracing::debug!(generated, cache_hits, "embeddings generated");
        }

        let vectors = items
            .iter()
            .map(|(key, _)| found.get(key).cloned().unwrap_or_default())
            .collect();
        Ok(Embedded {
            vectors,
            cache_hits,
            generated,
        })
    }

    /// Embed free text, caching by its digest.
    ///
    /// # Errors
    ///
    /// Returns the backend error once retries are exhausted.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let key = content_hash(text);
        let mut out = self.embed(&[(key.as_str(), text)]).await?;
        out.vectors.pop().ok_or(LlmError::EmptyResponse {
            provider: self.provider.name().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use quarry_llm::mock::MockEmbedder;
    use quarry_memory::CachePolicy;

    use super::*;

    fn embedder(mock: MockEmbedder, batch_size: usize) -> CachedEmbedder<MockEmbedder> {
        CachedEmbedder::new(
            Arc::new(mock),
            Arc::new(EmbeddingCache::new(CachePolicy::default())),
            RetryPolicy::default(),
            batch_size,
        )
    }

    #[tokio::test]
    async fn second_pass_hits_cache() {
        let mock = MockEmbedder::default();
        let e = embedder(mock.clone(), 8);
        let items = [("h1", "fn a() {}"), ("h2", "fn b() {}")];

        let first = e.embed(&items).await.unwrap();
        assert_eq!(first.generated, 2);
        assert_eq!(first.cache_hits, 0);

        let second = e.embed(&items).await.unwrap();
        assert_eq!(second.generated, 0);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(first.vectors, second.vectors);
        assert_eq!(mock.texts_embedded(), 2);
    }

    #[tokio::test]
    async fn misses_are_batched() {
        let mock = MockEmbedder::default();
        let e = embedder(mock.clone(), 2);
        let items: Vec<(String, String)> = (0..5)
            .map(|i| (format!("h{i}"), format!("text {i}")))
            .collect();
        let refs: Vec<(&str, &str)> = items
            .iter()
            .map(|(k, t)| (k.as_str(), t.as_str()))
            .collect();
        let out = e.embed(&refs).await.unwrap();
        assert_eq!(out.vectors.len(), 5);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn duplicate_digests_embedded_once() {
        let mock = MockEmbedder::default();
        let e = embedder(mock.clone(), 8);
        let out = e
            .embed(&[("same", "body"), ("same", "body")])
            .await
            .unwrap();
        assert_eq!(out.vectors.len(), 2);
        assert_eq!(out.vectors[0], out.vectors[1]);
        assert_eq!(mock.texts_embedded(), 1);
    }

    #[tokio::test]
    async fn other_model_entries_are_regenerated() {
        let mock = MockEmbedder::default();
        let e = embedder(mock.clone(), 8);
        e.cache().insert("h", vec![9.0], "some-other-model");
        let out = e.embed(&[("h", "text")]).await.unwrap();
        assert_eq!(out.generated, 1);
        assert_ne!(out.vectors[0], vec![9.0]);
    }

    #[tokio::test]
    async fn backend_failure_propagates() {
        let e = embedder(MockEmbedder::failing_on("boom"), 8);
        let err = e.embed(&[("h", "boom")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Other(_)));
    }

    #[tokio::test]
    async fn query_text_is_cached() {
        let mock = MockEmbedder::default();
        let e = embedder(mock.clone(), 8);
        let a = e.embed_text("how does retry work").await.unwrap();
        let b = e.embed_text("how does retry work").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mock.texts_embedded(), 1);
    }
}

//! Test-only mock embedding provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::LlmError;
use crate::provider::EmbeddingProvider;

/// Deterministic embedder: each text maps to a bag-of-bytes vector, so equal
/// inputs always produce equal vectors.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    pub dimensions: usize,
    pub model: String,
    /// Texts containing this marker fail with a permanent error.
    pub fail_marker: Option<String>,
    /// Milliseconds to sleep before returning.
    pub delay_ms: u64,
    calls: Arc<AtomicUsize>,
    texts_embedded: Arc<AtomicUsize>,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self {
            dimensions: 16,
            model: "mock-embed".into(),
            fail_marker: None,
            delay_ms: 0,
            calls: Arc::new(AtomicUsize::new(0)),
            texts_embedded: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            fail_marker: Some(marker.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    /// Number of backend calls (single or batch) made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of individual texts embedded so far.
    #[must_use]
    pub fn texts_embedded(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        if let Some(marker) = &self.fail_marker
            && text.contains(marker.as_str())
        {
            return Err(LlmError::Other("mock embedding error".into()));
        }
        let mut v = vec![0.0_f32; self.dimensions.max(1)];
        let len = v.len();
        for (i, b) in text.bytes().enumerate() {
            v[(usize::from(b) + i) % len] += 1.0;
        }
        Ok(v)
    }

    async fn pause(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
    }
}

impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.pause().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(1, Ordering::SeqCst);
        self.vector_for(text)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.pause().await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        texts.iter().map(|t| self.vector_for(t)).collect()
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }
}

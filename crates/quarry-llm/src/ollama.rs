use ollama_rs::Ollama;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::LlmError;
use crate::provider::{EmbeddingProvider, exact_batch, single};

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Ollama,
    embedding_model: String,
}

impl OllamaEmbedder {
    #[must_use]
    pub fn new(base_url: &str, embedding_model: String) -> Self {
        let (host, port) = parse_host_port(base_url);
        Self {
            client: Ollama::new(host, port),
            embedding_model,
        }
    }

    async fn request(&self, input: EmbeddingsInput) -> Result<Vec<Vec<f32>>, LlmError> {
        let request = GenerateEmbeddingsRequest::new(self.embedding_model.clone(), input);
        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(|e| LlmError::Other(format!("Ollama embedding request failed: {e}")))?;
        Ok(response.embeddings)
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        single("ollama", self.request(EmbeddingsInput::from(text)).await?)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request(EmbeddingsInput::Multiple(texts.to_vec())).await?;
        exact_batch(texts.len(), vectors)
    }

    fn model(&self) -> &str {
        &self.embedding_model
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "ollama"
    }
}

const DEFAULT_PORT: u16 = 11434;

/// Split `scheme://host[:port][/]` into the pieces `Ollama::new` expects.
fn parse_host_port(url: &str) -> (String, u16) {
    let url = url.trim_end_matches('/');
    url.rsplit_once(':')
        .and_then(|(host, port)| Some((host.to_owned(), port.parse().ok()?)))
        .unwrap_or_else(|| (url.to_owned(), DEFAULT_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_split() {
        let cases = [
            ("http://localhost:11434", "http://localhost", 11434),
            ("http://localhost", "http://localhost", DEFAULT_PORT),
            ("http://embed-box:9000/", "http://embed-box", 9000),
            ("http://localhost:notaport", "http://localhost:notaport", DEFAULT_PORT),
        ];
        for (url, host, port) in cases {
            assert_eq!(parse_host_port(url), (host.to_owned(), port), "{url}");
        }
    }

    #[test]
    fn model_and_name() {
        let embedder = OllamaEmbedder::new("http://localhost:11434", "nomic-embed-text".into());
        assert_eq!(embedder.model(), "nomic-embed-text");
        assert_eq!(embedder.name(), "ollama");
    }

    #[tokio::test]
    async fn embed_with_unreachable_endpoint_errors() {
        let embedder = OllamaEmbedder::new("http://127.0.0.1:1", "nomic-embed-text".into());
        assert!(embedder.embed("hello").await.is_err());
    }

    #[tokio::test]
    async fn empty_batch_skips_request() {
        let embedder = OllamaEmbedder::new("http://127.0.0.1:1", "nomic-embed-text".into());
        assert!(embedder.embed_batch(&[]).await.unwrap().is_empty());
    }
}

//! Component wiring: config in, embedder/cache/index/orchestrator out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use quarry_index::{
    BatchOptions, BatchOrchestrator, BlockExtractor, CachedEmbedder, HybridRetriever,
};
use quarry_llm::any::AnyEmbedder;
use quarry_llm::http::build_client;
use quarry_llm::ollama::OllamaEmbedder;
use quarry_llm::openai::OpenAiEmbedder;
use quarry_memory::{ChunkIndex, EmbeddingCache};

use crate::config::{Config, ProviderKind};

/// Priority: `cli` flag > `QUARRY_CONFIG` env > `config/default.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("QUARRY_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

/// # Errors
///
/// Returns an error if the provider needs settings that are missing or the
/// HTTP client cannot be built.
pub fn create_embedder(config: &Config) -> anyhow::Result<AnyEmbedder> {
    let cfg = &config.embedding;
    match cfg.provider {
        ProviderKind::Ollama => Ok(AnyEmbedder::Ollama(OllamaEmbedder::new(
            &cfg.base_url,
            cfg.model.clone(),
        ))),
        ProviderKind::OpenAi => {
            let api_key = cfg
                .api_key
                .clone()
                .context("embedding.api_key required for openai provider")?;
            let client = build_client(Duration::from_secs(cfg.timeout_secs))
                .context("failed to build HTTP client")?;
            Ok(AnyEmbedder::OpenAi(OpenAiEmbedder::new(
                client,
                api_key,
                cfg.base_url.clone(),
                cfg.model.clone(),
            )))
        }
        ProviderKind::Mock => {
            #[cfg(any(test, feature = "mock"))]
            {
                Ok(AnyEmbedder::Mock(quarry_llm::mock::MockEmbedder::default()))
            }
            #[cfg(not(any(test, feature = "mock")))]
            {
                anyhow::bail!("the mock embedding provider requires the `mock` feature")
            }
        }
    }
}

/// Long-lived components shared by every command.
pub struct App {
    pub config: Config,
    pub cache: Arc<EmbeddingCache>,
    pub index: Arc<ChunkIndex>,
    pub embedder: Arc<CachedEmbedder<AnyEmbedder>>,
    maintenance: CancellationToken,
    maintenance_task: JoinHandle<()>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Build every component and start cache maintenance.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the embedding
    /// backend cannot be constructed. An unreachable vector backend is not
    /// an error; the index falls back to the in-process store.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let provider = create_embedder(&config)?;

        let mut cache = EmbeddingCache::new(config.cache.policy());
        if let Some(path) = &config.cache.path {
            cache = cache.with_snapshot(path.clone()).await;
        }
        let cache = Arc::new(cache);
        let maintenance = CancellationToken::new();
        let maintenance_task = cache.spawn_maintenance(maintenance.clone());

        let embedder = Arc::new(CachedEmbedder::new(
            Arc::new(provider),
            Arc::clone(&cache),
            config.retry.policy(config.embedding.timeout_secs),
            config.indexing.batch_size,
        ));

        let index = Arc::new(
            ChunkIndex::connect(
                config.vector.qdrant_url.as_deref(),
                &config.vector.collection,
                config.retry.policy(config.vector.timeout_secs),
            )
            .await,
        );

        tracing::info!(
            provider = config.embedding.provider.as_str(),
            model = %config.embedding.model,
            backend = index.backend_name(),
            collection = %config.vector.collection,
            "components ready"
        );

        Ok(Self {
            config,
            cache,
            index,
            embedder,
            maintenance,
            maintenance_task,
        })
    }

    #[must_use]
    pub fn orchestrator(&self, root: impl Into<PathBuf>) -> BatchOrchestrator<AnyEmbedder> {
        BatchOrchestrator::new(
            root,
            Arc::new(BlockExtractor::new(self.config.indexing.window_lines)),
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the ranking settings are invalid.
    pub fn retriever(&self) -> anyhow::Result<HybridRetriever<AnyEmbedder>> {
        HybridRetriever::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.index),
            self.config.retrieval.ranker(),
        )
        .context("invalid retrieval settings")
    }

    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        self.config.indexing.batch_options()
    }

    /// Stop maintenance; the task persists the cache before exiting.
    pub async fn shutdown(self) {
        self.maintenance.cancel();
        if let Err(e) = self.maintenance_task.await {
            tracing::warn!("cache maintenance task failed: {e}");
            self.cache.shutdown().await;
        }
    }
}

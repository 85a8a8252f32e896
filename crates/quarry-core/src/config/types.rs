use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quarry_index::{BatchOptions, RankerConfig, TokenBudget};
use quarry_llm::RetryPolicy;
use quarry_memory::CachePolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    #[serde(rename = "openai")]
    OpenAi,
    Mock,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_embedding_base_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "qwen3-embedding".into()
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_url: default_embedding_base_url(),
            model: default_embedding_model(),
            api_key: None,
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    /// Unset means the in-process store.
    #[serde(default = "default_qdrant_url")]
    pub qdrant_url: Option<String>,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_vector_timeout_secs")]
    pub timeout_secs: u64,
}

#[allow(clippy::unnecessary_wraps)]
fn default_qdrant_url() -> Option<String> {
    Some("http://localhost:6334".into())
}

fn default_collection() -> String {
    "quarry_chunks".into()
}

fn default_vector_timeout_secs() -> u64 {
    10
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            qdrant_url: default_qdrant_url(),
            collection: default_collection(),
            timeout_secs: default_vector_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// Retry policy with a per-attempt timeout.
    #[must_use]
    pub fn policy(&self, timeout_secs: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            ..RetryPolicy::default()
        }
        .with_timeout(Duration::from_secs(timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Snapshot file; unset keeps the cache in memory only.
    #[serde(default = "default_cache_path")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub persist_interval_secs: Option<u64>,
}

#[allow(clippy::unnecessary_wraps)]
fn default_cache_path() -> Option<PathBuf> {
    Some(PathBuf::from(".quarry/embeddings.json"))
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_max_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_cache_sweep_interval_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_entries: default_cache_max_entries(),
            max_bytes: default_cache_max_bytes(),
            ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
            persist_interval_secs: None,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
            ttl: Duration::from_secs(self.ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            persist_interval: self.persist_interval_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexingConfig {
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_skip_embedding_regeneration")]
    pub skip_embedding_regeneration: bool,
    /// Longest chunk the built-in extractor emits, in lines.
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
}

fn default_max_concurrent_files() -> usize {
    4
}

fn default_batch_size() -> usize {
    32
}

fn default_skip_embedding_regeneration() -> bool {
    true
}

fn default_window_lines() -> usize {
    60
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            batch_size: default_batch_size(),
            strict: false,
            dry_run: false,
            skip_embedding_regeneration: default_skip_embedding_regeneration(),
            window_lines: default_window_lines(),
        }
    }
}

impl IndexingConfig {
    #[must_use]
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_concurrent_files: self.max_concurrent_files,
            batch_size: self.batch_size,
            skip_embedding_regeneration: self.skip_embedding_regeneration,
            dry_run: self.dry_run,
            strict: self.strict,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    #[serde(default = "default_expected_weight_total")]
    pub expected_weight_total: f32,
    #[serde(default)]
    pub rerank: bool,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f32,
    #[serde(default)]
    pub diversity_factor: f32,
    #[serde(default)]
    pub min_score_threshold: f32,
    #[serde(default = "default_max_results_per_source")]
    pub max_results_per_source: usize,
    #[serde(default = "default_deduplication_threshold")]
    pub deduplication_threshold: f32,
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Budget used when a query does not name one.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_estimation_buffer_factor")]
    pub estimation_buffer_factor: f32,
}

fn default_semantic_weight() -> f32 {
    0.7
}

fn default_keyword_weight() -> f32 {
    0.3
}

fn default_expected_weight_total() -> f32 {
    1.0
}

fn default_rrf_k() -> f32 {
    60.0
}

fn default_max_results_per_source() -> usize {
    3
}

fn default_deduplication_threshold() -> f32 {
    0.9
}

fn default_candidate_multiplier() -> usize {
    3
}

fn default_max_tokens() -> usize {
    8_000
}

fn default_estimation_buffer_factor() -> f32 {
    1.1
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            expected_weight_total: default_expected_weight_total(),
            rerank: false,
            rrf_k: default_rrf_k(),
            diversity_factor: 0.0,
            min_score_threshold: 0.0,
            max_results_per_source: default_max_results_per_source(),
            deduplication_threshold: default_deduplication_threshold(),
            candidate_multiplier: default_candidate_multiplier(),
            max_tokens: default_max_tokens(),
            estimation_buffer_factor: default_estimation_buffer_factor(),
        }
    }
}

impl RetrievalConfig {
    #[must_use]
    pub fn ranker(&self) -> RankerConfig {
        RankerConfig {
            semantic_weight: self.semantic_weight,
            keyword_weight: self.keyword_weight,
            expected_weight_total: self.expected_weight_total,
            rerank: self.rerank,
            rrf_k: self.rrf_k,
            diversity_factor: self.diversity_factor,
            min_score_threshold: self.min_score_threshold,
            max_results_per_source: self.max_results_per_source,
            deduplication_threshold: self.deduplication_threshold,
            candidate_multiplier: self.candidate_multiplier,
        }
    }

    /// Token budget, defaulting to `max_tokens` when `override_tokens` is unset.
    #[must_use]
    pub fn budget(&self, override_tokens: Option<usize>) -> TokenBudget {
        TokenBudget {
            max_tokens: override_tokens.unwrap_or(self.max_tokens),
            estimation_buffer_factor: self.estimation_buffer_factor,
        }
    }
}

use std::path::PathBuf;
use std::str::FromStr;

use super::Config;

/// Parsed value of `key`, or `None` when unset. Unparseable values are
/// logged and ignored.
fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    if let Ok(v) = raw.trim().parse() {
        Some(v)
    } else {
        tracing::warn!("ignoring invalid {key} value: {raw}");
        None
    }
}

/// Empty string clears an optional setting.
fn optional(key: &str) -> Option<Option<String>> {
    let v = std::env::var(key).ok()?;
    Some(if v.trim().is_empty() { None } else { Some(v) })
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_backends();
        self.apply_env_overrides_cache();
        self.apply_env_overrides_indexing();
        self.apply_env_overrides_retrieval();
    }

    fn apply_env_overrides_backends(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.embedding.provider = kind;
            } else {
                tracing::warn!("ignoring invalid QUARRY_EMBEDDING_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = optional("QUARRY_EMBEDDING_API_KEY") {
            self.embedding.api_key = v;
        }
        if let Some(secs) = parsed("QUARRY_EMBEDDING_TIMEOUT") {
            self.embedding.timeout_secs = secs;
        }
        if let Some(v) = optional("QUARRY_QDRANT_URL") {
            self.vector.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_COLLECTION") {
            self.vector.collection = v;
        }
        if let Some(secs) = parsed("QUARRY_VECTOR_TIMEOUT") {
            self.vector.timeout_secs = secs;
        }
        if let Some(n) = parsed("QUARRY_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = n;
        }
        if let Some(ms) = parsed("QUARRY_RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = ms;
        }
    }

    fn apply_env_overrides_cache(&mut self) {
        if let Some(v) = optional("QUARRY_CACHE_PATH") {
            self.cache.path = v.map(PathBuf::from);
        }
        if let Some(n) = parsed("QUARRY_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = n;
        }
        if let Some(n) = parsed("QUARRY_CACHE_MAX_BYTES") {
            self.cache.max_bytes = n;
        }
        if let Some(secs) = parsed("QUARRY_CACHE_TTL_SECS") {
            self.cache.ttl_secs = secs;
        }
        if let Some(secs) = parsed("QUARRY_CACHE_SWEEP_INTERVAL_SECS") {
            self.cache.sweep_interval_secs = secs;
        }
        if let Some(secs) = parsed("QUARRY_CACHE_PERSIST_INTERVAL_SECS") {
            self.cache.persist_interval_secs = Some(secs);
        }
    }

    fn apply_env_overrides_indexing(&mut self) {
        if let Some(n) = parsed("QUARRY_INDEX_MAX_CONCURRENT_FILES") {
            self.indexing.max_concurrent_files = n;
        }
        if let Some(n) = parsed("QUARRY_INDEX_BATCH_SIZE") {
            self.indexing.batch_size = n;
        }
        if let Some(strict) = parsed("QUARRY_INDEX_STRICT") {
            self.indexing.strict = strict;
        }
        if let Some(dry_run) = parsed("QUARRY_INDEX_DRY_RUN") {
            self.indexing.dry_run = dry_run;
        }
        if let Some(skip) = parsed("QUARRY_INDEX_SKIP_EMBEDDING_REGENERATION") {
            self.indexing.skip_embedding_regeneration = skip;
        }
        if let Some(n) = parsed("QUARRY_INDEX_WINDOW_LINES") {
            self.indexing.window_lines = n;
        }
    }

    fn apply_env_overrides_retrieval(&mut self) {
        if let Some(w) = parsed("QUARRY_RETRIEVAL_SEMANTIC_WEIGHT") {
            self.retrieval.semantic_weight = w;
        }
        if let Some(w) = parsed("QUARRY_RETRIEVAL_KEYWORD_WEIGHT") {
            self.retrieval.keyword_weight = w;
        }
        if let Some(rerank) = parsed("QUARRY_RETRIEVAL_RERANK") {
            self.retrieval.rerank = rerank;
        }
        if let Some(d) = parsed("QUARRY_RETRIEVAL_DIVERSITY_FACTOR") {
            self.retrieval.diversity_factor = d;
        }
        if let Some(t) = parsed("QUARRY_RETRIEVAL_MIN_SCORE") {
            self.retrieval.min_score_threshold = t;
        }
        if let Some(n) = parsed("QUARRY_RETRIEVAL_MAX_TOKENS") {
            self.retrieval.max_tokens = n;
        }
    }
}

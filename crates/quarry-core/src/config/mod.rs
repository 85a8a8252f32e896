mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file, apply `QUARRY_*` overrides and
    /// validate the result.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the final configuration is invalid.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.provider == ProviderKind::OpenAi && self.embedding.api_key.is_none() {
            bail!("embedding.api_key is required for the openai provider");
        }
        if self.embedding.timeout_secs == 0 || self.vector.timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        if self.vector.collection.trim().is_empty() {
            bail!("vector.collection must not be empty");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        if self.cache.max_entries == 0 || self.cache.max_bytes == 0 {
            bail!("cache.max_entries and cache.max_bytes must be >= 1");
        }
        if self.cache.sweep_interval_secs == 0 || self.cache.persist_interval_secs == Some(0) {
            bail!("cache intervals must be at least one second");
        }
        if self.indexing.max_concurrent_files == 0
            || self.indexing.batch_size == 0
            || self.indexing.window_lines == 0
        {
            bail!("indexing.max_concurrent_files, batch_size and window_lines must be >= 1");
        }
        if self.retrieval.estimation_buffer_factor <= 0.0 {
            bail!("retrieval.estimation_buffer_factor must be positive");
        }
        self.retrieval
            .ranker()
            .validate()
            .context("invalid retrieval settings")?;
        Ok(())
    }
}

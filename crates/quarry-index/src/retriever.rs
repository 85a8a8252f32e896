//! Query-time retrieval: embed, search, rank, trim to a token budget.

use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use quarry_llm::EmbeddingProvider;
use quarry_memory::{ChunkIndex, FieldCondition, FieldValue, VectorFilter};

use crate::chunk::Chunk;
use crate::embedder::CachedEmbedder;
use crate::error::Result;
use crate::ranker::{BudgetWarning, RankerConfig, ScoredChunk, TokenBudget, rank, trim_to_budget};

/// Restrictions applied to candidates before ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    /// Exact file paths.
    pub files: Vec<String>,
    pub path_prefixes: Vec<String>,
    pub languages: Vec<String>,
    pub chunk_types: Vec<String>,
    /// Accepted for compatibility; records carry no commit metadata.
    pub commit_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    #[serde(default)]
    pub filters: QueryFilters,
    pub top_k: usize,
    /// Minimum raw similarity passed to the vector search.
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl RetrievalQuery {
    #[must_use]
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            filters: QueryFilters::default(),
            top_k,
            min_score: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunks: Vec<ScoredChunk>,
    pub estimated_tokens: usize,
    pub budget: TokenBudget,
    /// Ranked results were dropped to fit the budget.
    pub truncated: bool,
    /// The vector search failed and the result is empty.
    pub degraded: bool,
    pub warnings: Vec<BudgetWarning>,
}

pub struct HybridRetriever<P> {
    embedder: Arc<CachedEmbedder<P>>,
    index: Arc<ChunkIndex>,
    config: RankerConfig,
}

impl<P: EmbeddingProvider> HybridRetriever<P> {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidConfig`](crate::IndexError::InvalidConfig)
    /// if `config` fails validation.
    pub fn new(
        embedder: Arc<CachedEmbedder<P>>,
        index: Arc<ChunkIndex>,
        config: RankerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embedder,
            index,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// Rank indexed chunks against `query` and keep the longest prefix that
    /// fits `budget`.
    ///
    /// A failing vector search yields an empty, `degraded` result.
    ///
    /// # Errors
    ///
    /// Returns an error if the query cannot be embedded.
    pub async fn retrieve(
        &self,
        query: &RetrievalQuery,
        budget: TokenBudget,
    ) -> Result<RetrievalResult> {
        let mut result = RetrievalResult {
            chunks: Vec::new(),
            estimated_tokens: 0,
            budget,
            truncated: false,
            degraded: false,
            warnings: Vec::new(),
        };
        if query.top_k == 0 {
            return Ok(result);
        }
        if let Some(range) = &query.filters.commit_range {
            tracing::warn!(range, "commit range filter is not supported, ignoring");
        }

        let vector = self.embedder.embed_text(&query.text).await?;
        let limit = query
            .top_k
            .saturating_mul(self.config.candidate_multiplier)
            .max(query.top_k);

        let hits = match self
            .index
            .search(
                vector,
                limit,
                query.min_score,
                pushdown_filter(&query.filters),
            )
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("vector search failed, returning degraded result: {e:#}");
                result.degraded = true;
                return Ok(result);
            }
        };

        let candidates: Vec<(Chunk, f32)> = hits
            .into_iter()
            .map(|hit| (Chunk::from_record(&hit.record), hit.score))
            .filter(|(chunk, _)| matches_filters(chunk, &query.filters))
            .collect();
        let candidate_count = candidates.len();

        let mut ranked = rank(&query.text, candidates, query.top_k, &self.config);
        let (kept, tokens) = trim_to_budget(&ranked, &budget);

        if kept < ranked.len() {
            if kept == 0 {
                result.warnings.push(BudgetWarning::NothingFits {
                    first_cost: budget.cost(&ranked[0].chunk.content),
                    max_tokens: budget.max_tokens,
                });
            } else {
                result.warnings.push(BudgetWarning::Truncated {
                    kept,
                    dropped: ranked.len() - kept,
                    max_tokens: budget.max_tokens,
                });
            }
            result.truncated = true;
            ranked.truncate(kept);
        }

        tracing::debug!(
            candidates = candidate_count,
            returned = ranked.len(),
            tokens,
            "retrieval complete"
        );
        result.chunks = ranked;
        result.estimated_tokens = tokens;
        Ok(result)
    }
}

fn any_text(field: &str, values: &[String]) -> Option<FieldCondition> {
    if values.is_empty() {
        return None;
    }
    Some(FieldCondition {
        field: field.to_owned(),
        value: FieldValue::AnyText(values.to_vec()),
    })
}

/// Equality filters the vector backend can evaluate itself.
fn pushdown_filter(filters: &QueryFilters) -> Option<VectorFilter> {
    let must: Vec<FieldCondition> = [
        any_text("file_path", &filters.files),
        any_text("language", &filters.languages),
        any_text("chunk_type", &filters.chunk_types),
    ]
    .into_iter()
    .flatten()
    .collect();
    if must.is_empty() {
        None
    } else {
        Some(VectorFilter {
            must,
            must_not: Vec::new(),
        })
    }
}

fn matches_filters(chunk: &Chunk, filters: &QueryFilters) -> bool {
    let allowed = |values: &[String], v: &str| values.is_empty() || values.iter().any(|x| x == v);
    allowed(&filters.files, &chunk.file_path)
        && allowed(&filters.languages, &chunk.language)
        && allowed(&filters.chunk_types, &chunk.chunk_type)
        && (filters.path_prefixes.is_empty()
            || filters
                .path_prefixes
                .iter()
                .any(|p| chunk.file_path.starts_with(p.as_str())))
}

/// Render retrieved chunks as XML for prompt injection.
#[must_use]
pub fn format_as_context(result: &RetrievalResult) -> String {
    if result.chunks.is_empty() {
        return String::new();
    }

    let mut out = String::from("<code_context>\n");
    for scored in &result.chunks {
        let c = &scored.chunk;
        let _ = writeln!(
            out,
            "  <chunk file=\"{}\" lines=\"{}-{}\" type=\"{}\" score=\"{:.2}\">",
            c.file_path,
            c.start_line,
            c.end_line,
            c.chunk_type,
            scored.score(),
        );
        out.push_str(&c.content);
        out.push_str("\n  </chunk>\n");
    }
    out.push_str("</code_context>");
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use quarry_llm::RetryPolicy;
    use quarry_llm::mock::MockEmbedder;
    use quarry_memory::{CachePolicy, EmbeddingCache, InMemoryVectorStore};

    use super::*;

    const COLLECTION: &str = "chunks";

    fn embedder() -> Arc<CachedEmbedder<MockEmbedder>> {
        Arc::new(CachedEmbedder::new(
            Arc::new(MockEmbedder::default()),
            Arc::new(EmbeddingCache::new(CachePolicy::default())),
            RetryPolicy::default(),
            8,
        ))
    }

    async fn seeded(chunks: &[Chunk]) -> (Arc<CachedEmbedder<MockEmbedder>>, Arc<ChunkIndex>) {
        let embedder = embedder();
        let index = Arc::new(ChunkIndex::with_store(
            Arc::new(InMemoryVectorStore::new()),
            COLLECTION,
            RetryPolicy::default(),
        ));
        index.ensure_collection(16).await.unwrap();
        let mut records = Vec::new();
        for c in chunks {
            let v = embedder.embed_text(&c.content).await.unwrap();
            records.push((c.to_record(Utc::now()), v));
        }
        index.upsert(records).await.unwrap();
        (embedder, index)
    }

    fn chunk(path: &str, start: usize, lang: &str, content: &str) -> Chunk {
        Chunk::new(path, content.into(), lang, (start, start + 2), "block")
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            chunk("src/retry.rs", 1, "rust", "fn retry_with_backoff() { sleep(delay) }"),
            chunk("src/cache.rs", 1, "rust", "fn evict_least_recent(cache) {}"),
            chunk("web/app.ts", 1, "typescript", "function retryFetch() { backoff() }"),
            chunk("docs/guide.md", 1, "markdown", "Retry and backoff are configured here."),
        ]
    }

    fn retriever(
        embedder: Arc<CachedEmbedder<MockEmbedder>>,
        index: Arc<ChunkIndex>,
    ) -> HybridRetriever<MockEmbedder> {
        HybridRetriever::new(embedder, index, RankerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn exact_content_ranks_first() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let q = RetrievalQuery::new("fn evict_least_recent(cache) {}", 2);
        let out = r.retrieve(&q, TokenBudget::new(10_000)).await.unwrap();
        assert_eq!(out.chunks.len(), 2);
        assert_eq!(out.chunks[0].chunk.file_path, "src/cache.rs");
        assert!((out.chunks[0].semantic_score - 1.0).abs() < 1e-5);
        assert!(!out.truncated && !out.degraded);
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn language_filter_is_pushed_down() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let mut q = RetrievalQuery::new("retry backoff", 10);
        q.filters.languages = vec!["rust".into()];
        let out = r.retrieve(&q, TokenBudget::new(10_000)).await.unwrap();
        assert!(!out.chunks.is_empty());
        assert!(out.chunks.iter().all(|c| c.chunk.language == "rust"));
    }

    #[tokio::test]
    async fn path_prefix_filter() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let mut q = RetrievalQuery::new("retry backoff", 10);
        q.filters.path_prefixes = vec!["web/".into(), "docs/".into()];
        let out = r.retrieve(&q, TokenBudget::new(10_000)).await.unwrap();
        assert_eq!(out.chunks.len(), 2);
        assert!(
            out.chunks
                .iter()
                .all(|c| !c.chunk.file_path.starts_with("src/"))
        );
    }

    #[tokio::test]
    async fn commit_range_is_ignored() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let mut q = RetrievalQuery::new("retry", 10);
        q.filters.commit_range = Some("HEAD~3..HEAD".into());
        let out = r.retrieve(&q, TokenBudget::new(10_000)).await.unwrap();
        assert_eq!(out.chunks.len(), 4);
    }

    #[tokio::test]
    async fn budget_truncates_with_warning() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let q = RetrievalQuery::new("retry backoff", 4);
        let full = r.retrieve(&q, TokenBudget::new(10_000)).await.unwrap();
        let first_cost = TokenBudget::new(0).cost(&full.chunks[0].chunk.content);

        let out = r.retrieve(&q, TokenBudget::new(first_cost)).await.unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.estimated_tokens, first_cost);
        assert!(out.truncated);
        assert!(matches!(
            out.warnings[0],
            BudgetWarning::Truncated { kept: 1, dropped: 3, .. }
        ));
        assert_eq!(out.chunks[0].chunk.id, full.chunks[0].chunk.id);
    }

    #[tokio::test]
    async fn zero_budget_returns_nothing() {
        let (e, i) = seeded(&corpus()).await;
        let r = retriever(e, i);
        let out = r
            .retrieve(&RetrievalQuery::new("retry", 3), TokenBudget::new(0))
            .await
            .unwrap();
        assert!(out.chunks.is_empty());
        assert!(matches!(out.warnings[0], BudgetWarning::NothingFits { .. }));
    }

    #[tokio::test]
    async fn search_failure_degrades() {
        // No collection was ever created.
        let index = Arc::new(ChunkIndex::with_store(
            Arc::new(InMemoryVectorStore::new()),
            COLLECTION,
            RetryPolicy::default(),
        ));
        let r = retriever(embedder(), index);
        let out = r
            .retrieve(&RetrievalQuery::new("anything", 5), TokenBudget::new(100))
            .await
            .unwrap();
        assert!(out.degraded);
        assert!(out.chunks.is_empty());
    }

    #[tokio::test]
    async fn invalid_weights_rejected() {
        let (e, i) = seeded(&[]).await;
        let cfg = RankerConfig {
            semantic_weight: 0.9,
            ..RankerConfig::default()
        };
        assert!(HybridRetriever::new(e, i, cfg).is_err());
    }

    #[test]
    fn context_xml() {
        let result = RetrievalResult {
            chunks: vec![ScoredChunk {
                chunk: chunk("src/a.rs", 3, "rust", "fn a() {}"),
                semantic_score: 0.9,
                keyword_score: 0.5,
                hybrid_score: 0.78,
                rerank_score: None,
            }],
            estimated_tokens: 3,
            budget: TokenBudget::new(100),
            truncated: false,
            degraded: false,
            warnings: Vec::new(),
        };
        let xml = format_as_context(&result);
        assert!(xml.starts_with("<code_context>"));
        assert!(xml.contains("file=\"src/a.rs\" lines=\"3-5\" type=\"block\" score=\"0.78\""));
        assert!(xml.contains("fn a() {}"));
    }
}

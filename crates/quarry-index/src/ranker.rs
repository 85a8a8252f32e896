//! Hybrid ranking pipeline over nearest-neighbour candidates.
//!
//! Stages run in a fixed order: hybrid scoring, optional reciprocal rank
//! fusion with a per-file diversity penalty, score threshold, per-source cap,
//! near-duplicate removal, `top_k` cut, and finally token-budget trimming.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use quarry_memory::estimate_tokens;
use serde::Serialize;

use crate::chunk::Chunk;
use crate::error::IndexError;

const WEIGHT_TOLERANCE: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub struct RankerConfig {
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    /// Required sum of the two weights.
    pub expected_weight_total: f32,
    pub rerank: bool,
    pub rrf_k: f32,
    /// Per prior same-file hit, scores are multiplied by `1 - diversity_factor`.
    pub diversity_factor: f32,
    pub min_score_threshold: f32,
    pub max_results_per_source: usize,
    /// Token Jaccard similarity above which two results count as duplicates.
    pub deduplication_threshold: f32,
    /// Candidates fetched per requested result.
    pub candidate_multiplier: usize,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            expected_weight_total: 1.0,
            rerank: false,
            rrf_k: 60.0,
            diversity_factor: 0.0,
            min_score_threshold: 0.0,
            max_results_per_source: 3,
            deduplication_threshold: 0.9,
            candidate_multiplier: 3,
        }
    }
}

impl RankerConfig {
    /// # Errors
    ///
    /// Returns [`IndexError::InvalidConfig`] when weights do not add up to
    /// `expected_weight_total` or a factor is out of range.
    pub fn validate(&self) -> Result<(), IndexError> {
        let invalid = |msg: String| Err(IndexError::InvalidConfig(msg));
        if self.semantic_weight < 0.0 || self.keyword_weight < 0.0 {
            return invalid("ranking weights must be non-negative".into());
        }
        let total = self.semantic_weight + self.keyword_weight;
        if (total - self.expected_weight_total).abs() > WEIGHT_TOLERANCE {
            return invalid(format!(
                "semantic_weight + keyword_weight = {total}, expected {}",
                self.expected_weight_total
            ));
        }
        if !(0.0..=1.0).contains(&self.diversity_factor) {
            return invalid(format!(
                "diversity_factor {} outside [0, 1]",
                self.diversity_factor
            ));
        }
        if !(0.0..=1.0).contains(&self.deduplication_threshold) {
            return invalid(format!(
                "deduplication_threshold {} outside [0, 1]",
                self.deduplication_threshold
            ));
        }
        if self.rrf_k <= 0.0 {
            return invalid("rrf_k must be positive".into());
        }
        if self.max_results_per_source == 0 || self.candidate_multiplier == 0 {
            return invalid("max_results_per_source and candidate_multiplier must be >= 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub semantic_score: f32,
    pub keyword_score: f32,
    pub hybrid_score: f32,
    pub rerank_score: Option<f32>,
}

impl ScoredChunk {
    /// Score that determines final order.
    #[must_use]
    pub fn score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.hybrid_score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenBudget {
    pub max_tokens: usize,
    /// Multiplier applied to the four-characters-per-token estimate.
    pub estimation_buffer_factor: f32,
}

impl TokenBudget {
    #[must_use]
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            estimation_buffer_factor: 1.0,
        }
    }

    /// `ceil(chars / 4 * factor)`
    #[must_use]
    pub fn cost(&self, content: &str) -> usize {
        estimate_tokens(content, self.estimation_buffer_factor)
    }
}

/// Non-fatal notes attached to a budgeted result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BudgetWarning {
    Truncated {
        kept: usize,
        dropped: usize,
        max_tokens: usize,
    },
    /// Not even the top result fits.
    NothingFits { first_cost: usize, max_tokens: usize },
}

/// Lowercased alphanumeric tokens of at least two characters.
#[must_use]
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect()
}

/// Share of query tokens present in the chunk's content or path.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn keyword_overlap(query_tokens: &HashSet<String>, chunk: &Chunk) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let mut doc = tokenize(&chunk.content);
    doc.extend(tokenize(&chunk.file_path));
    let hits = query_tokens.iter().filter(|t| doc.contains(*t)).count();
    hits as f32 / query_tokens.len() as f32
}

/// Token-set Jaccard similarity. Two chunks without indexable tokens are
/// compared on their trimmed text instead.
#[allow(clippy::cast_precision_loss)]
fn similarity(a: &HashSet<String>, a_text: &str, b: &HashSet<String>, b_text: &str) -> f32 {
    if a.is_empty() && b.is_empty() {
        return if a_text.trim() == b_text.trim() { 1.0 } else { 0.0 };
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f32 / union as f32
}

fn by_score_desc(
    score: impl Fn(&ScoredChunk) -> f32,
) -> impl Fn(&ScoredChunk, &ScoredChunk) -> Ordering {
    move |a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
            .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
    }
}

/// Weighted semantic + keyword score, sorted best first.
#[must_use]
pub fn score_candidates(
    query: &str,
    candidates: Vec<(Chunk, f32)>,
    config: &RankerConfig,
) -> Vec<ScoredChunk> {
    let query_tokens = tokenize(query);
    let mut scored: Vec<ScoredChunk> = candidates
        .into_iter()
        .map(|(chunk, semantic_score)| {
            let keyword_score = keyword_overlap(&query_tokens, &chunk);
            ScoredChunk {
                hybrid_score: config.semantic_weight * semantic_score
                    + config.keyword_weight * keyword_score,
                chunk,
                semantic_score,
                keyword_score,
                rerank_score: None,
            }
        })
        .collect();
    scored.sort_by(by_score_desc(|c| c.hybrid_score));
    scored
}

/// Reciprocal rank fusion of the semantic and keyword rankings, then a
/// multiplicative penalty for each earlier result from the same file.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rerank(mut scored: Vec<ScoredChunk>, config: &RankerConfig) -> Vec<ScoredChunk> {
    let mut fused = vec![0.0_f32; scored.len()];
    for key in [
        (|c: &ScoredChunk| c.semantic_score) as fn(&ScoredChunk) -> f32,
        |c: &ScoredChunk| c.keyword_score,
    ] {
        let mut order: Vec<usize> = (0..scored.len()).collect();
        let cmp = by_score_desc(key);
        order.sort_by(|&a, &b| cmp(&scored[a], &scored[b]));
        for (rank, idx) in order.into_iter().enumerate() {
            fused[idx] += 1.0 / (config.rrf_k + (rank + 1) as f32);
        }
    }
    for (c, f) in scored.iter_mut().zip(fused) {
        c.rerank_score = Some(f);
    }
    scored.sort_by(by_score_desc(ScoredChunk::score));

    let keep = 1.0 - config.diversity_factor;
    let mut seen: HashMap<String, i32> = HashMap::new();
    for c in &mut scored {
        let prior = seen.entry(c.chunk.file_path.clone()).or_insert(0);
        if let Some(s) = c.rerank_score.as_mut() {
            *s *= keep.powi(*prior);
        }
        *prior += 1;
    }
    // `sort_by` is stable, so equal scores keep their fused order.
    scored.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(Ordering::Equal));
    scored
}

/// Threshold, per-source cap and near-duplicate removal, preserving order.
#[must_use]
pub fn filter_results(scored: Vec<ScoredChunk>, config: &RankerConfig) -> Vec<ScoredChunk> {
    let mut per_source: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<(ScoredChunk, HashSet<String>)> = Vec::new();

    for c in scored {
        if c.hybrid_score < config.min_score_threshold {
            continue;
        }
        let count = per_source.entry(c.chunk.file_path.clone()).or_insert(0);
        if *count >= config.max_results_per_source {
            continue;
        }
        let tokens = tokenize(&c.chunk.content);
        if kept
            .iter()
            .any(|(k, t)| {
                similarity(t, &k.chunk.content, &tokens, &c.chunk.content)
                    > config.deduplication_threshold
            })
        {
            continue;
        }
        *count += 1;
        kept.push((c, tokens));
    }
    kept.into_iter().map(|(c, _)| c).collect()
}

/// Full ranking pipeline, ending with the `top_k` cut.
#[must_use]
pub fn rank(
    query: &str,
    candidates: Vec<(Chunk, f32)>,
    top_k: usize,
    config: &RankerConfig,
) -> Vec<ScoredChunk> {
    let mut scored = score_candidates(query, candidates, config);
    if config.rerank {
        scored = rerank(scored, config);
    }
    let mut filtered = filter_results(scored, config);
    filtered.truncate(top_k);
    filtered
}

/// Length of the longest prefix of `chunks` whose summed cost fits `budget`,
/// and that prefix's token total.
#[must_use]
pub fn trim_to_budget(chunks: &[ScoredChunk], budget: &TokenBudget) -> (usize, usize) {
    let mut prefix = Vec::with_capacity(chunks.len() + 1);
    prefix.push(0usize);
    let mut total = 0usize;
    for c in chunks {
        total = total.saturating_add(budget.cost(&c.chunk.content));
        prefix.push(total);
    }
    let fits = prefix.partition_point(|&sum| sum <= budget.max_tokens);
    let len = fits.saturating_sub(1);
    (len, prefix[len])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunk(path: &str, start: usize, content: &str) -> Chunk {
        Chunk::new(path, content.into(), "rust", (start, start + 1), "block")
    }

    fn scored(path: &str, start: usize, content: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(path, start, content),
            semantic_score: score,
            keyword_score: 0.0,
            hybrid_score: score,
            rerank_score: None,
        }
    }

    #[test]
    fn default_config_is_valid() {
        RankerConfig::default().validate().unwrap();
    }

    #[test]
    fn weights_are_validated_not_renormalized() {
        let cfg = RankerConfig {
            semantic_weight: 0.8,
            keyword_weight: 0.3,
            ..RankerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(IndexError::InvalidConfig(_))));

        let cfg = RankerConfig {
            semantic_weight: 1.4,
            keyword_weight: 0.6,
            expected_weight_total: 2.0,
            ..RankerConfig::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn diversity_out_of_range_rejected() {
        let cfg = RankerConfig {
            diversity_factor: 1.5,
            ..RankerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tokenize_lowercases_and_drops_short() {
        let t = tokenize("Retry_policy x with BackOff!");
        assert!(t.contains("retry"));
        assert!(t.contains("policy"));
        assert!(t.contains("backoff"));
        assert!(!t.contains("x"));
    }

    #[test]
    fn keyword_overlap_uses_path() {
        let q = tokenize("retry backoff");
        let c = chunk("src/retry.rs", 1, "fn delay() {}");
        assert!((keyword_overlap(&q, &c) - 0.5).abs() < f32::EPSILON);
        assert!(keyword_overlap(&HashSet::new(), &c).abs() < f32::EPSILON);
    }

    #[test]
    fn hybrid_score_combines_weights() {
        let cfg = RankerConfig::default();
        let out = score_candidates(
            "retry backoff",
            vec![
                (chunk("a.rs", 1, "retry with backoff"), 0.5),
                (chunk("b.rs", 1, "unrelated"), 0.6),
            ],
            &cfg,
        );
        assert_eq!(out[0].chunk.file_path, "a.rs");
        assert!((out[0].hybrid_score - (0.7 * 0.5 + 0.3 * 1.0)).abs() < 1e-6);
        assert!((out[1].hybrid_score - 0.7 * 0.6).abs() < 1e-6);
    }

    #[test]
    fn rrf_sums_reciprocal_ranks() {
        let cfg = RankerConfig {
            rerank: true,
            ..RankerConfig::default()
        };
        let mut a = scored("a.rs", 1, "alpha", 0.9);
        a.keyword_score = 0.0;
        let mut b = scored("b.rs", 1, "beta", 0.5);
        b.keyword_score = 1.0;
        let out = rerank(vec![a, b], &cfg);
        // Each is first in one list and second in the other.
        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        for c in &out {
            assert!((c.rerank_score.unwrap() - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn diversity_penalises_repeat_files() {
        let cfg = RankerConfig {
            rerank: true,
            diversity_factor: 0.5,
            ..RankerConfig::default()
        };
        let out = rerank(
            vec![
                scored("a.rs", 1, "one", 0.9),
                scored("a.rs", 10, "two", 0.8),
                scored("b.rs", 1, "three", 0.7),
            ],
            &cfg,
        );
        let paths: Vec<_> = out.iter().map(|c| c.chunk.file_path.as_str()).collect();
        assert_eq!(paths, vec!["a.rs", "b.rs", "a.rs"]);
    }

    #[test]
    fn tokenless_chunks_dedup_on_text() {
        let config = RankerConfig {
            max_results_per_source: 10,
            ..RankerConfig::default()
        };
        let out = filter_results(
            vec![
                scored("a.rs", 1, "}", 0.9),
                scored("a.rs", 5, "x = 1", 0.8),
                scored("a.rs", 9, "}", 0.7),
            ],
            &config,
        );
        let starts: Vec<_> = out.iter().map(|c| c.chunk.start_line).collect();
        assert_eq!(starts, vec![1, 5]);
    }

    #[test]
    fn threshold_cap_and_dedup() {
        let cfg = RankerConfig {
            min_score_threshold: 0.2,
            max_results_per_source: 2,
            deduplication_threshold: 0.8,
            ..RankerConfig::default()
        };
        let out = filter_results(
            vec![
                scored("a.rs", 1, "fn load config file", 0.9),
                scored("b.rs", 1, "fn load config file", 0.8),
                scored("a.rs", 5, "fn parse args", 0.7),
                scored("a.rs", 9, "fn write output", 0.6),
                scored("c.rs", 1, "fn low score", 0.1),
            ],
            &cfg,
        );
        let ids: Vec<_> = out.iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a.rs:1-2", "a.rs:5-6"]);
    }

    #[test]
    fn rank_truncates_to_top_k() {
        let cfg = RankerConfig {
            max_results_per_source: 10,
            ..RankerConfig::default()
        };
        let candidates = (0..10)
            .map(|i| (chunk("a.rs", i * 10, &format!("block number{i}")), 0.9))
            .collect();
        assert_eq!(rank("block", candidates, 4, &cfg).len(), 4);
    }

    #[test]
    fn budget_cost_rounds_up_with_factor() {
        let budget = TokenBudget {
            max_tokens: 100,
            estimation_buffer_factor: 1.5,
        };
        assert_eq!(budget.cost("abcd"), 2);
        assert_eq!(budget.cost("abcdefgh"), 3);
        assert_eq!(budget.cost(""), 0);
    }

    #[test]
    fn trim_keeps_longest_fitting_prefix() {
        let chunks = vec![
            scored("a", 1, &"x".repeat(40), 0.9),
            scored("b", 1, &"x".repeat(40), 0.8),
            scored("c", 1, &"x".repeat(4), 0.7),
        ];
        // costs 10, 10, 1
        assert_eq!(trim_to_budget(&chunks, &TokenBudget::new(25)), (2, 20));
        assert_eq!(trim_to_budget(&chunks, &TokenBudget::new(21)), (3, 21));
        assert_eq!(trim_to_budget(&chunks, &TokenBudget::new(5)), (0, 0));
        assert_eq!(trim_to_budget(&[], &TokenBudget::new(5)), (0, 0));
    }

    proptest! {
        #[test]
        fn trim_is_maximal(
            lens in proptest::collection::vec(0usize..400, 0..30),
            max_tokens in 0usize..800,
            factor in 0.5f32..2.0,
        ) {
            let chunks: Vec<ScoredChunk> = lens
                .iter()
                .enumerate()
                .map(|(i, &n)| scored("f", i, &"y".repeat(n), 1.0))
                .collect();
            let budget = TokenBudget { max_tokens, estimation_buffer_factor: factor };
            let (len, tokens) = trim_to_budget(&chunks, &budget);
            let sum: usize = chunks[..len].iter().map(|c| budget.cost(&c.chunk.content)).sum();
            prop_assert_eq!(sum, tokens);
            prop_assert!(tokens <= max_tokens);
            if len < chunks.len() {
                prop_assert!(tokens + budget.cost(&chunks[len].chunk.content) > max_tokens);
            }
        }
    }
}

//! Batch orchestrator: change set → reconcile → embed → index mutations.

use std::collections::HashSet;
use std::ops::{Add, AddAssign};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use quarry_llm::EmbeddingProvider;
use quarry_memory::{ChunkIndex, IndexRecord};

use crate::chunk::{ChangeStatus, Chunk, FileChange};
use crate::embedder::CachedEmbedder;
use crate::error::{IndexError, Result};
use crate::extract::ChunkExtractor;
use crate::reconcile::{ReconciliationResult, reconcile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub max_concurrent_files: usize,
    /// Maximum texts per embedding request.
    pub batch_size: usize,
    /// Refresh payloads of content-matched records instead of re-embedding them.
    pub skip_embedding_regeneration: bool,
    pub dry_run: bool,
    /// Abort the batch on the first per-file error.
    pub strict: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_concurrent_files: 4,
            batch_size: 32,
            skip_embedding_regeneration: true,
            dry_run: false,
            strict: false,
        }
    }
}

/// Summary of a batch run. Reports combine by plain addition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub files_processed: usize,
    pub chunks_added: usize,
    pub chunks_updated: usize,
    pub chunks_deleted: usize,
    pub chunks_unchanged: usize,
    pub files_skipped: usize,
    pub errors: Vec<String>,
    /// Set when a cancellation stopped the run between groups.
    pub cancelled: bool,
}

impl BatchReport {
    fn file_failed(path: &str, err: &IndexError) -> Self {
        Self {
            files_skipped: 1,
            errors: vec![format!("{path}: {err}")],
            ..Self::default()
        }
    }
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, rhs: Self) {
        self.files_processed += rhs.files_processed;
        self.chunks_added += rhs.chunks_added;
        self.chunks_updated += rhs.chunks_updated;
        self.chunks_deleted += rhs.chunks_deleted;
        self.chunks_unchanged += rhs.chunks_unchanged;
        self.files_skipped += rhs.files_skipped;
        self.errors.extend(rhs.errors);
        self.cancelled |= rhs.cancelled;
    }
}

impl Add for BatchReport {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl From<&ReconciliationResult> for BatchReport {
    fn from(plan: &ReconciliationResult) -> Self {
        Self {
            files_processed: 1,
            chunks_added: plan.to_add.len(),
            chunks_updated: plan.to_update.len(),
            chunks_deleted: plan.to_delete.len(),
            chunks_unchanged: plan.unchanged_count,
            ..Self::default()
        }
    }
}

pub struct BatchOrchestrator<P> {
    root: PathBuf,
    extractor: Arc<dyn ChunkExtractor>,
    embedder: Arc<CachedEmbedder<P>>,
    index: Arc<ChunkIndex>,
    /// Set once the collection has been created, sized by the first vector.
    collection_created: OnceCell<()>,
}

impl<P> std::fmt::Debug for BatchOrchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("root", &self.root)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

impl<P: EmbeddingProvider> BatchOrchestrator<P> {
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        extractor: Arc<dyn ChunkExtractor>,
        embedder: Arc<CachedEmbedder<P>>,
        index: Arc<ChunkIndex>,
    ) -> Self {
        Self {
            root: root.into(),
            extractor,
            embedder,
            index,
            collection_created: OnceCell::new(),
        }
    }

    /// Apply `changes` to the index.
    ///
    /// Deletions (including the old side of renames) run first. Remaining
    /// files are processed in groups of `max_concurrent_files`; each group
    /// finishes before the next starts and `cancel` is checked in between.
    /// Per-file failures are collected into the report.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Aborted`] carrying the partial report when a
    /// vector write fails or, in strict mode, when any file fails. Returns
    /// [`IndexError::VectorBackend`] if the collection cannot be queried.
    pub async fn process(
        &self,
        changes: &[FileChange],
        options: &BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let start = std::time::Instant::now();
        let (deletions, upserts) = partition(changes);
        let mut report = BatchReport::default();

        // A missing collection means nothing is indexed yet; it is created
        // on the first write.
        let collection_ready = self.index.collection_exists().await?;

        tracing::info!(
            deletions = deletions.len(),
            files = upserts.len(),
            dry_run = options.dry_run,
            "batch started"
        );

        for path in &deletions {
            match self.delete_file(path, options.dry_run, collection_ready).await {
                Ok(removed) => {
                    report.files_processed += 1;
                    report.chunks_deleted += removed;
                    tracing::debug!(file = %path, removed, "file removed from index");
                }
                Err(e) => return Err(self.abort(report, path, &e)),
            }
        }

        let total = upserts.len();
        let group_size = options.max_concurrent_files.max(1);
        for (i, group) in upserts.chunks(group_size).enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(
                    done = i * group_size,
                    total,
                    "batch cancelled, returning partial result"
                );
                report.cancelled = true;
                break;
            }

            let outcomes = join_all(
                group
                    .iter()
                    .map(|path| self.process_file(path, options, collection_ready)),
            )
            .await;

            let mut abort_on: Option<(&str, IndexError)> = None;
            for (path, outcome) in group.iter().zip(outcomes) {
                match outcome {
                    Ok(file_report) => {
                        tracing::debug!(
                            file = %path,
                            added = file_report.chunks_added,
                            updated = file_report.chunks_updated,
                            deleted = file_report.chunks_deleted,
                            unchanged = file_report.chunks_unchanged,
                        );
                        report += file_report;
                    }
                    Err(e) => {
                        tracing::warn!(file = %path, "skipped: {e}");
                        report += BatchReport::file_failed(path, &e);
                        if abort_on.is_none() && (options.strict || e.is_fatal()) {
                            abort_on = Some((path.as_str(), e));
                        }
                    }
                }
            }
            tracing::info!(
                progress = format_args!("{}/{total}", i * group_size + group.len()),
                "group finished"
            );

            if let Some((path, e)) = abort_on {
                return Err(IndexError::Aborted {
                    reason: format!("{path}: {e}"),
                    report: Box::new(report),
                });
            }
        }

        tracing::info!(
            files = report.files_processed,
            added = report.chunks_added,
            updated = report.chunks_updated,
            deleted = report.chunks_deleted,
            unchanged = report.chunks_unchanged,
            skipped = report.files_skipped,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "batch finished"
        );
        Ok(report)
    }

    fn abort(&self, mut report: BatchReport, path: &str, err: &IndexError) -> IndexError {
        report += BatchReport::file_failed(path, err);
        tracing::warn!(file = %path, backend = self.index.backend_name(), "batch aborted: {err}");
        IndexError::Aborted {
            reason: format!("{path}: {err}"),
            report: Box::new(report),
        }
    }

    async fn delete_file(&self, path: &str, dry_run: bool, collection_ready: bool) -> Result<usize> {
        if !collection_ready {
            return Ok(0);
        }
        let existing = self.index.records_for_file(path).await?.len();
        if !dry_run && existing > 0 {
            self.index.delete_by_file(path).await?;
        }
        Ok(existing)
    }

    async fn existing_chunks(&self, path: &str, collection_ready: bool) -> Result<Vec<Chunk>> {
        if !collection_ready {
            return Ok(Vec::new());
        }
        Ok(self
            .index
            .records_for_file(path)
            .await?
            .iter()
            .map(Chunk::from_record)
            .collect())
    }

    async fn process_file(
        &self,
        path: &str,
        options: &BatchOptions,
        collection_ready: bool,
    ) -> Result<BatchReport> {
        let content = tokio::fs::read_to_string(self.root.join(path))
            .await
            .map_err(|source| IndexError::FileRead {
                path: path.into(),
                source,
            })?;
        let chunks = self.extractor.extract(path, &content)?;
        let existing = self.existing_chunks(path, collection_ready).await?;

        let plan = reconcile(&chunks, &existing);
        let file_report = BatchReport::from(&plan);
        if options.dry_run || plan.is_noop() {
            return Ok(file_report);
        }
        self.apply(plan, options).await?;
        Ok(file_report)
    }

    /// Embed first so a backend failure leaves the index untouched, then
    /// delete, update and add in that order.
    async fn apply(&self, plan: ReconciliationResult, options: &BatchOptions) -> Result<()> {
        let now = Utc::now();
        let reembed = !options.skip_embedding_regeneration;

        let mut to_embed: Vec<&Chunk> = plan.to_add.iter().collect();
        if reembed {
            to_embed.extend(plan.to_update.iter().map(|(_, c)| c));
        }
        let items: Vec<(&str, &str)> = to_embed
            .iter()
            .map(|c| (c.content_hash.as_str(), c.content.as_str()))
            .collect();
        let embedded = self.embedder.embed_batched(&items, options.batch_size).await?;
        if let Some(first) = embedded.vectors.first() {
            self.ensure_collection(first.len()).await?;
        }
        let mut vectors = embedded.vectors.into_iter();

        self.index.delete(&plan.to_delete).await?;

        let add_vectors: Vec<Vec<f32>> = vectors.by_ref().take(plan.to_add.len()).collect();
        if reembed {
            let updates: Vec<(IndexRecord, Vec<f32>)> = plan
                .to_update
                .iter()
                .map(|(_, c)| c.to_record(now))
                .zip(vectors)
                .collect();
            self.index.upsert(updates).await?;
        } else {
            for (_, chunk) in &plan.to_update {
                self.index.update_payload(&chunk.to_record(now)).await?;
            }
        }

        let adds: Vec<(IndexRecord, Vec<f32>)> = plan
            .to_add
            .iter()
            .map(|c| c.to_record(now))
            .zip(add_vectors)
            .collect();
        self.index.upsert(adds).await?;
        Ok(())
    }
}

impl<P> BatchOrchestrator<P> {
    async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        self.collection_created
            .get_or_try_init(|| async {
                self.index
                    .ensure_collection(u64::try_from(dimension).unwrap_or(u64::MAX))
                    .await
            })
            .await?;
        Ok(())
    }
}

/// Split a change set into paths to drop and paths to (re)index, each
/// deduplicated in first-seen order.
fn partition(changes: &[FileChange]) -> (Vec<String>, Vec<String>) {
    let mut deletions = Vec::new();
    let mut upserts = Vec::new();
    let mut seen_del = HashSet::new();
    let mut seen_up = HashSet::new();

    for change in changes {
        match change.status {
            ChangeStatus::Deleted => {
                if seen_del.insert(change.path.as_str()) {
                    deletions.push(change.path.clone());
                }
            }
            ChangeStatus::Renamed => {
                if let Some(prev) = change.previous_path.as_deref()
                    && prev != change.path
                    && seen_del.insert(prev)
                {
                    deletions.push(prev.to_owned());
                }
                if seen_up.insert(change.path.as_str()) {
                    upserts.push(change.path.clone());
                }
            }
            ChangeStatus::Added | ChangeStatus::Modified => {
                if seen_up.insert(change.path.as_str()) {
                    upserts.push(change.path.clone());
                }
            }
        }
    }
    (deletions, upserts)
}

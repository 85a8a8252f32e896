//! Chunk-level index over a [`VectorStore`].
//!
//! The backend is chosen once in [`ChunkIndex::connect`]: a remote Qdrant
//! instance when its health probe succeeds, otherwise the in-process store.
//! Every store call afterwards goes through the same timeout and retry policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use quarry_llm::{RetryPolicy, with_retry};
use serde_json::json;

use crate::error::MemoryError;
use crate::in_memory_store::InMemoryVectorStore;
use crate::qdrant_ops::QdrantOps;
use crate::vector_store::{FieldCondition, VectorFilter, VectorPoint, VectorStore};

const CHUNK_NAMESPACE: uuid::Uuid = uuid::Uuid::from_bytes([
    0x71, 0x75, 0x61, 0x72, // "quar"
    0x72, 0x79, 0x2d, 0x63, // "ry-c"
    0x68, 0x75, 0x6e, 0x6b, // "hunk"
    0x00, 0x00, 0x00, 0x01, // version
]);

/// Storage address of a chunk: a UUID derived from its positional id.
#[must_use]
pub fn point_id(chunk_id: &str) -> String {
    uuid::Uuid::new_v5(&CHUNK_NAMESPACE, chunk_id.as_bytes()).to_string()
}

/// Persisted form of a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    /// Positional id, `path:start-end`, possibly with a `#hash` suffix.
    pub id: String,
    pub file_path: String,
    pub content: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    pub chunk_type: String,
    /// Absent on records written before digests were stored.
    pub content_hash: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl IndexRecord {
    #[must_use]
    pub fn to_payload(&self) -> HashMap<String, serde_json::Value> {
        let mut payload = HashMap::from([
            ("chunk_id".to_owned(), json!(self.id)),
            ("file_path".to_owned(), json!(self.file_path)),
            ("content".to_owned(), json!(self.content)),
            ("language".to_owned(), json!(self.language)),
            ("start_line".to_owned(), json!(self.start_line)),
            ("end_line".to_owned(), json!(self.end_line)),
            ("chunk_type".to_owned(), json!(self.chunk_type)),
            ("processed_at".to_owned(), json!(self.processed_at.to_rfc3339())),
        ]);
        if let Some(hash) = &self.content_hash {
            payload.insert("content_hash".to_owned(), json!(hash));
        }
        payload
    }

    /// Rebuild a record from a stored payload.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::MalformedRecord`] when a required field is missing
    /// or has the wrong type.
    pub fn from_payload(
        point_id: &str,
        payload: &HashMap<String, serde_json::Value>,
    ) -> Result<Self, MemoryError> {
        let malformed = |field: &'static str| MemoryError::MalformedRecord {
            id: point_id.to_owned(),
            field,
        };
        let text = |field: &'static str| {
            payload
                .get(field)
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| malformed(field))
        };
        let line = |field: &'static str| {
            payload
                .get(field)
                .and_then(serde_json::Value::as_u64)
                .and_then(|v| usize::try_from(v).ok())
                .ok_or_else(|| malformed(field))
        };

        let processed_at = payload
            .get("processed_at")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |t| t.with_timezone(&Utc));

        Ok(Self {
            id: text("chunk_id")?,
            file_path: text("file_path")?,
            content: text("content")?,
            language: text("language").unwrap_or_default(),
            start_line: line("start_line")?,
            end_line: line("end_line")?,
            chunk_type: text("chunk_type").unwrap_or_default(),
            content_hash: text("content_hash").ok(),
            processed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchCandidate {
    pub record: IndexRecord,
    pub score: f32,
}

pub struct ChunkIndex {
    store: Arc<dyn VectorStore>,
    collection: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ChunkIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkIndex")
            .field("backend", &self.store.backend_name())
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl ChunkIndex {
    /// Select a backend by probing Qdrant at `url`; falls back to the
    /// in-process store when `url` is `None` or the probe fails.
    pub async fn connect(url: Option<&str>, collection: &str, retry: RetryPolicy) -> Self {
        let store: Arc<dyn VectorStore> = match url {
            Some(url) => match QdrantOps::new(url) {
                Ok(ops) => match tokio::time::timeout(retry.timeout, ops.health()).await {
                    Ok(Ok(())) => {
                        tracing::info!(url, "using qdrant vector backend");
                        Arc::new(ops)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(url, "qdrant unavailable ({e}), using in-memory index");
                        Arc::new(InMemoryVectorStore::new())
                    }
                    Err(_) => {
                        tracing::warn!(url, "qdrant health probe timed out, using in-memory index");
                        Arc::new(InMemoryVectorStore::new())
                    }
                },
                Err(e) => {
                    tracing::warn!(url, "invalid qdrant url ({e}), using in-memory index");
                    Arc::new(InMemoryVectorStore::new())
                }
            },
            None => Arc::new(InMemoryVectorStore::new()),
        };
        Self::with_store(store, collection, retry)
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn VectorStore>, collection: &str, retry: RetryPolicy) -> Self {
        Self {
            store,
            collection: collection.to_owned(),
            retry,
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// # Errors
    ///
    /// Returns an error if the collection cannot be created.
    pub async fn ensure_collection(&self, vector_size: u64) -> Result<(), MemoryError> {
        with_retry(&self.retry, "ensure_collection", || {
            self.store.ensure_collection(&self.collection, vector_size)
        })
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    pub async fn collection_exists(&self) -> Result<bool, MemoryError> {
        Ok(with_retry(&self.retry, "collection_exists", || {
            self.store.collection_exists(&self.collection)
        })
        .await?)
    }

    /// Insert or overwrite records together with their vectors.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write after retries.
    pub async fn upsert(&self, records: Vec<(IndexRecord, Vec<f32>)>) -> Result<(), MemoryError> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<VectorPoint> = records
            .into_iter()
            .map(|(record, vector)| VectorPoint {
                id: point_id(&record.id),
                vector,
                payload: record.to_payload(),
            })
            .collect();
        with_retry(&self.retry, "upsert", || {
            self.store.upsert(&self.collection, points.clone())
        })
        .await?;
        Ok(())
    }

    /// Refresh a record's payload in place, keeping its stored vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write after retries.
    pub async fn update_payload(&self, record: &IndexRecord) -> Result<(), MemoryError> {
        let id = point_id(&record.id);
        let payload = record.to_payload();
        with_retry(&self.retry, "set_payload", || {
            self.store
                .set_payload(&self.collection, id.clone(), payload.clone())
        })
        .await?;
        Ok(())
    }

    /// Delete records by positional id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the delete after retries.
    pub async fn delete(&self, ids: &[String]) -> Result<(), MemoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let point_ids: Vec<String> = ids.iter().map(|id| point_id(id)).collect();
        with_retry(&self.retry, "delete", || {
            self.store
                .delete_by_ids(&self.collection, point_ids.clone())
        })
        .await?;
        Ok(())
    }

    /// Delete every record belonging to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the delete after retries.
    pub async fn delete_by_file(&self, path: &str) -> Result<(), MemoryError> {
        let filter = file_filter(path);
        with_retry(&self.retry, "delete_by_file", || {
            self.store.delete_by_filter(&self.collection, filter.clone())
        })
        .await?;
        Ok(())
    }

    /// All records stored for `path`, ordered by start line. Points whose
    /// payload cannot be read are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the scroll fails.
    pub async fn records_for_file(&self, path: &str) -> Result<Vec<IndexRecord>, MemoryError> {
        let filter = file_filter(path);
        let points = with_retry(&self.retry, "scroll", || {
            self.store.scroll(&self.collection, filter.clone())
        })
        .await?;
        let mut records: Vec<IndexRecord> = points
            .iter()
            .filter_map(|p| match IndexRecord::from_payload(&p.id, &p.payload) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(file = path, "skipping stored chunk: {e}");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| {
            a.start_line
                .cmp(&b.start_line)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Nearest neighbours of `vector`. Hits with unreadable payloads are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the search fails after retries.
    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: usize,
        min_score: Option<f32>,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<SearchCandidate>, MemoryError> {
        let limit = u64::try_from(limit)?;
        let hits = with_retry(&self.retry, "search", || {
            self.store.search(
                &self.collection,
                vector.clone(),
                limit,
                filter.clone(),
                min_score,
            )
        })
        .await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| match IndexRecord::from_payload(&hit.id, &hit.payload) {
                Ok(record) => Some(SearchCandidate {
                    record,
                    score: hit.score,
                }),
                Err(e) => {
                    tracing::warn!("skipping search hit: {e}");
                    None
                }
            })
            .collect())
    }

    /// Whether the active backend currently answers.
    pub async fn health(&self) -> bool {
        matches!(
            tokio::time::timeout(self.retry.timeout, self.store.health()).await,
            Ok(Ok(()))
        )
    }
}

fn file_filter(path: &str) -> VectorFilter {
    VectorFilter {
        must: vec![FieldCondition::text("file_path", path)],
        must_not: vec![],
    }
}

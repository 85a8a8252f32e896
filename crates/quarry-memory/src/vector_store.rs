use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use quarry_llm::Retryable;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("scroll error: {0}")]
    Scroll(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl Retryable for VectorStoreError {
    fn is_retryable(&self) -> bool {
        // Collection and serialization failures are deterministic.
        matches!(
            self,
            Self::Connection(_)
                | Self::Timeout { .. }
                | Self::Upsert(_)
                | Self::Search(_)
                | Self::Delete(_)
                | Self::Scroll(_)
        )
    }

    fn timed_out(operation: &str, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.to_owned(),
            after,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl VectorFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

impl FieldCondition {
    #[must_use]
    pub fn text(field: &str, value: impl Into<String>) -> Self {
        Self {
            field: field.to_owned(),
            value: FieldValue::Text(value.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
    /// Matches when the field equals any of the values.
    AnyText(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

/// A stored point returned by a payload scroll; vectors are not fetched.
#[derive(Debug, Clone)]
pub struct PayloadPoint {
    pub id: String,
    pub payload: HashMap<String, serde_json::Value>,
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait VectorStore: Send + Sync {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Replace the payload of existing points without touching their vectors.
    fn set_payload(
        &self,
        collection: &str,
        id: String,
        payload: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
        score_threshold: Option<f32>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Fetch every point matching `filter`, payload only.
    fn scroll(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<Vec<PayloadPoint>, VectorStoreError>>;

    fn health(&self) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_retry() {
        assert!(VectorStoreError::Connection("refused".into()).is_retryable());
        assert!(VectorStoreError::timed_out("search", Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn shape_errors_do_not_retry() {
        assert!(!VectorStoreError::Serialization("bad".into()).is_retryable());
        assert!(!VectorStoreError::Collection("missing".into()).is_retryable());
    }

    #[test]
    fn empty_filter() {
        assert!(VectorFilter::default().is_empty());
        let f = VectorFilter {
            must: vec![FieldCondition::text("file_path", "src/lib.rs")],
            must_not: vec![],
        };
        assert!(!f.is_empty());
    }
}

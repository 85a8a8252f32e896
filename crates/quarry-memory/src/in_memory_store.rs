use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::vector_store::{
    BoxFuture, FieldValue, PayloadPoint, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};

type Payload = HashMap<String, serde_json::Value>;

struct Entry {
    vector: Vec<f32>,
    norm: f32,
    payload: Payload,
}

struct Collection {
    dimension: usize,
    entries: HashMap<String, Entry>,
}

/// Process-local vector store used when no remote backend is reachable.
///
/// Search is an exhaustive cosine scan; vector norms are computed once on
/// insert. Like Qdrant, a collection fixes its dimension on creation and
/// rejects vectors of any other size.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points in `collection`, or zero if it does not exist.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.read(collection, |c| c.entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn read<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&Collection) -> T,
    ) -> Result<T, VectorStoreError> {
        let cols = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        cols.get(collection).map(f).ok_or_else(|| missing(collection))
    }

    fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut Collection) -> Result<T, VectorStoreError>,
    ) -> Result<T, VectorStoreError> {
        let mut cols = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        cols.get_mut(collection)
            .ok_or_else(|| missing(collection))
            .and_then(f)
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore").finish_non_exhaustive()
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, entry: &Entry) -> f32 {
    if query_norm == 0.0 || entry.norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(&entry.vector).map(|(a, b)| a * b).sum();
    dot / (query_norm * entry.norm)
}

fn field_matches(val: &serde_json::Value, expected: &FieldValue) -> bool {
    match expected {
        FieldValue::Integer(i) => val.as_i64() == Some(*i),
        FieldValue::Text(s) => val.as_str() == Some(s.as_str()),
        FieldValue::AnyText(options) => val
            .as_str()
            .is_some_and(|v| options.iter().any(|o| o == v)),
    }
}

fn matches(payload: &Payload, filter: &VectorFilter) -> bool {
    let holds = |c: &crate::vector_store::FieldCondition| {
        payload.get(&c.field).is_some_and(|v| field_matches(v, &c.value))
    };
    filter.must.iter().all(holds) && !filter.must_not.iter().any(holds)
}

fn missing(collection: &str) -> VectorStoreError {
    VectorStoreError::Collection(format!("collection {collection} not found"))
}

impl VectorStore for InMemoryVectorStore {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let dimension = usize::try_from(vector_size)
                .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
            let mut cols = self
                .collections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            cols.entry(collection).or_insert_with(|| Collection {
                dimension,
                entries: HashMap::new(),
            });
            Ok(())
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let exists = self.read(collection, |_| ()).is_ok();
        Box::pin(async move { Ok(exists) })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection);
        Box::pin(async { Ok(()) })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let result = self.write(collection, |col| {
            if let Some(bad) = points.iter().find(|p| p.vector.len() != col.dimension) {
                return Err(VectorStoreError::Collection(format!(
                    "point {} has {} dimensions, collection expects {}",
                    bad.id,
                    bad.vector.len(),
                    col.dimension
                )));
            }
            for p in points {
                let entry = Entry {
                    norm: norm(&p.vector),
                    vector: p.vector,
                    payload: p.payload,
                };
                col.entries.insert(p.id, entry);
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn set_payload(
        &self,
        collection: &str,
        id: String,
        payload: Payload,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let result = self.write(collection, |col| {
            if let Some(entry) = col.entries.get_mut(&id) {
                entry.payload.extend(payload);
            }
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
        score_threshold: Option<f32>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let filter = filter.unwrap_or_default();
        let threshold = score_threshold.unwrap_or(f32::NEG_INFINITY);
        let query_norm = norm(&vector);
        let result = self.read(collection, |col| {
            let mut hits: Vec<ScoredVectorPoint> = col
                .entries
                .iter()
                .filter(|(_, e)| matches(&e.payload, &filter))
                .map(|(id, e)| (id, e, cosine(&vector, query_norm, e)))
                .filter(|(_, _, score)| *score >= threshold)
                .map(|(id, e, score)| ScoredVectorPoint {
                    id: id.clone(),
                    score,
                    payload: e.payload.clone(),
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
            hits.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            hits
        });
        Box::pin(async move { result })
    }

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let result = if ids.is_empty() {
            Ok(())
        } else {
            self.write(collection, |col| {
                for id in &ids {
                    col.entries.remove(id);
                }
                Ok(())
            })
        };
        Box::pin(async move { result })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let result = self.write(collection, |col| {
            col.entries.retain(|_, e| !matches(&e.payload, &filter));
            Ok(())
        });
        Box::pin(async move { result })
    }

    fn scroll(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<Vec<PayloadPoint>, VectorStoreError>> {
        let result = self.read(collection, |col| {
            col.entries
                .iter()
                .filter(|(_, e)| matches(&e.payload, &filter))
                .map(|(id, e)| PayloadPoint {
                    id: id.clone(),
                    payload: e.payload.clone(),
                })
                .collect()
        });
        Box::pin(async move { result })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async { Ok(()) })
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::vector_store::FieldCondition;

    const COL: &str = "chunks";

    fn chunk_point(id: &str, vector: Vec<f32>, file: &str, lang: &str) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            payload: HashMap::from([
                ("file_path".into(), json!(file)),
                ("language".into(), json!(lang)),
            ]),
        }
    }

    async fn indexed() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        store.ensure_collection(COL, 3).await.unwrap();
        store
            .upsert(
                COL,
                vec![
                    chunk_point("lib-1", vec![1.0, 0.0, 0.0], "src/lib.rs", "rust"),
                    chunk_point("app-1", vec![0.0, 1.0, 0.0], "web/app.ts", "typescript"),
                    chunk_point("lib-2", vec![0.8, 0.2, 0.0], "src/lib.rs", "rust"),
                ],
            )
            .await
            .unwrap();
        store
    }

    fn by_file(file: &str) -> VectorFilter {
        VectorFilter {
            must: vec![FieldCondition::text("file_path", file)],
            must_not: vec![],
        }
    }

    #[tokio::test]
    async fn ensure_collection_keeps_existing_points() {
        let store = indexed().await;
        store.ensure_collection(COL, 3).await.unwrap();
        assert_eq!(store.len(COL), 3);
        store.delete_collection(COL).await.unwrap();
        assert!(!store.collection_exists(COL).await.unwrap());
    }

    #[tokio::test]
    async fn nearest_first_with_id_tie_break() {
        let store = indexed().await;
        store
            .upsert(
                COL,
                vec![chunk_point("lib-0", vec![2.0, 0.0, 0.0], "src/lib.rs", "rust")],
            )
            .await
            .unwrap();
        let hits = store
            .search(COL, vec![1.0, 0.0, 0.0], 3, None, None)
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["lib-0", "lib-1", "lib-2"]);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn threshold_and_any_of_filter() {
        let store = indexed().await;
        let hits = store
            .search(COL, vec![1.0, 0.0, 0.0], 10, None, Some(0.5))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);

        let filter = VectorFilter {
            must: vec![FieldCondition {
                field: "language".into(),
                value: FieldValue::AnyText(vec!["typescript".into(), "go".into()]),
            }],
            must_not: vec![],
        };
        let hits = store
            .search(COL, vec![1.0, 0.0, 0.0], 10, Some(filter), None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "app-1");
    }

    #[tokio::test]
    async fn must_not_excludes() {
        let store = indexed().await;
        let filter = VectorFilter {
            must: vec![],
            must_not: vec![FieldCondition::text("language", "rust")],
        };
        let points = store.scroll(COL, filter).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, "app-1");
    }

    #[tokio::test]
    async fn deletes_by_file_and_id() {
        let store = indexed().await;
        store.delete_by_filter(COL, by_file("src/lib.rs")).await.unwrap();
        assert_eq!(store.len(COL), 1);
        store.delete_by_ids(COL, vec!["app-1".into()]).await.unwrap();
        assert!(store.is_empty(COL));
    }

    #[tokio::test]
    async fn set_payload_merges_and_keeps_vector() {
        let store = indexed().await;
        store
            .set_payload(COL, "lib-1".into(), HashMap::from([("start_line".into(), json!(40))]))
            .await
            .unwrap();
        let hits = store
            .search(COL, vec![1.0, 0.0, 0.0], 1, None, None)
            .await
            .unwrap();
        assert_eq!(hits[0].id, "lib-1");
        assert_eq!(hits[0].payload["start_line"], json!(40));
        assert_eq!(hits[0].payload["file_path"], json!("src/lib.rs"));
    }

    #[tokio::test]
    async fn scroll_by_file() {
        let store = indexed().await;
        let mut ids: Vec<_> = store
            .scroll(COL, by_file("src/lib.rs"))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["lib-1", "lib-2"]);
    }

    #[tokio::test]
    async fn wrong_dimension_rejected() {
        let store = indexed().await;
        let err = store
            .upsert(COL, vec![chunk_point("x", vec![1.0, 0.0], "f.rs", "rust")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Collection(_)));
        assert_eq!(store.len(COL), 3);
    }

    #[tokio::test]
    async fn unknown_collection_errors() {
        let store = InMemoryVectorStore::new();
        let err = store
            .upsert("nope", vec![chunk_point("a", vec![1.0], "f", "rust")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Collection(_)));
        let err = store
            .search("nope", vec![1.0], 1, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Collection(_)));
    }

    #[test]
    fn zero_vectors_score_zero() {
        let e = Entry {
            vector: vec![1.0, 1.0],
            norm: norm(&[1.0, 1.0]),
            payload: Payload::new(),
        };
        assert!(cosine(&[0.0, 0.0], 0.0, &e).abs() < f32::EPSILON);
        let orthogonal = [1.0, -1.0];
        assert!(cosine(&orthogonal, norm(&orthogonal), &e).abs() < 1e-6);
    }
}

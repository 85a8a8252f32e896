//! Qdrant-backed [`VectorStore`].

use std::collections::HashMap;

use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointId,
    PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    SetPayloadPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder, point_id::PointIdOptions,
    value::Kind,
};
use qdrant_client::{Payload, Qdrant};

use crate::vector_store::{
    BoxFuture, FieldCondition, FieldValue, PayloadPoint, ScoredVectorPoint, VectorFilter,
    VectorPoint, VectorStore, VectorStoreError,
};

type QdrantResult<T> = Result<T, Box<qdrant_client::QdrantError>>;

const SCROLL_PAGE: u32 = 100;

/// Thin wrapper over the [`Qdrant`] client.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps").finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a client for the given URL. No connection is made until the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed into a client configuration.
    pub fn new(url: &str) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url).build().map_err(Box::new)?;
        Ok(Self { client })
    }

    async fn create_if_missing(&self, collection: &str, vector_size: u64) -> QdrantResult<()> {
        if self
            .client
            .collection_exists(collection)
            .await
            .map_err(Box::new)?
        {
            return Ok(());
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, Distance::Cosine)),
            )
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    async fn scroll_filtered(
        &self,
        collection: &str,
        filter: Filter,
    ) -> QdrantResult<Vec<PayloadPoint>> {
        let mut out = Vec::new();
        let mut offset: Option<PointId> = None;

        loop {
            let mut builder = ScrollPointsBuilder::new(collection)
                .filter(filter.clone())
                .with_payload(true)
                .with_vectors(false)
                .limit(SCROLL_PAGE);
            if let Some(ref off) = offset {
                builder = builder.offset(off.clone());
            }

            let response = self.client.scroll(builder).await.map_err(Box::new)?;
            out.extend(response.result.into_iter().map(|p| PayloadPoint {
                id: id_string(p.id),
                payload: from_qdrant_payload(p.payload),
            }));

            match response.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(out)
    }

    /// Convert a JSON object into a Qdrant payload map.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if the value is not an object of representable values.
    pub fn json_to_payload(
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, qdrant_client::qdrant::Value>, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
    }
}

fn tagged<E: std::fmt::Display>(
    kind: fn(String) -> VectorStoreError,
) -> impl Fn(E) -> VectorStoreError {
    move |e| kind(e.to_string())
}

fn to_qdrant_payload(
    payload: HashMap<String, serde_json::Value>,
) -> Result<HashMap<String, qdrant_client::qdrant::Value>, VectorStoreError> {
    QdrantOps::json_to_payload(payload).map_err(tagged(VectorStoreError::Serialization))
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            self.create_if_missing(&name, vector_size)
                .await
                .map_err(tagged(VectorStoreError::Collection))
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            self.client
                .collection_exists(&name)
                .await
                .map_err(tagged(VectorStoreError::Collection))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            self.client
                .delete_collection(&name)
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Collection))
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let mut batch = Vec::with_capacity(points.len());
            for point in points {
                let payload = to_qdrant_payload(point.payload)?;
                batch.push(PointStruct::new(point.id, point.vector, payload));
            }
            self.client
                .upsert_points(UpsertPointsBuilder::new(&name, batch).wait(true))
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Upsert))
        })
    }

    fn set_payload(
        &self,
        collection: &str,
        id: String,
        payload: HashMap<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let payload = Payload::from(to_qdrant_payload(payload)?);
            let request = SetPayloadPointsBuilder::new(&name, payload)
                .points_selector(PointsIdsList {
                    ids: vec![PointId::from(id)],
                })
                .wait(true);
            self.client
                .set_payload(request)
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Upsert))
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
        score_threshold: Option<f32>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let mut request = SearchPointsBuilder::new(&name, vector, limit).with_payload(true);
            if let Some(filter) = filter.filter(|f| !f.is_empty()) {
                request = request.filter(to_qdrant_filter(filter));
            }
            if let Some(threshold) = score_threshold {
                request = request.score_threshold(threshold);
            }
            let response = self
                .client
                .search_points(request)
                .await
                .map_err(tagged(VectorStoreError::Search))?;
            let hits = response.result.into_iter().map(|hit| ScoredVectorPoint {
                id: id_string(hit.id),
                score: hit.score,
                payload: from_qdrant_payload(hit.payload),
            });
            Ok(hits.collect())
        })
    }

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(());
            }
            let selector = PointsIdsList {
                ids: ids.into_iter().map(PointId::from).collect(),
            };
            self.client
                .delete_points(DeletePointsBuilder::new(&name).points(selector).wait(true))
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Delete))
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            let selector = to_qdrant_filter(filter);
            self.client
                .delete_points(DeletePointsBuilder::new(&name).points(selector).wait(true))
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Delete))
        })
    }

    fn scroll(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<Vec<PayloadPoint>, VectorStoreError>> {
        let name = collection.to_owned();
        Box::pin(async move {
            self.scroll_filtered(&name, to_qdrant_filter(filter))
                .await
                .map_err(tagged(VectorStoreError::Scroll))
        })
    }

    fn health(&self) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async move {
            self.client
                .health_check()
                .await
                .map(drop)
                .map_err(tagged(VectorStoreError::Connection))
        })
    }

    fn backend_name(&self) -> &'static str {
        "qdrant"
    }
}

fn to_qdrant_filter(filter: VectorFilter) -> Filter {
    let convert = |conds: Vec<FieldCondition>| -> Vec<Condition> {
        conds
            .into_iter()
            .map(|c| match c.value {
                FieldValue::Integer(n) => Condition::matches(c.field, n),
                FieldValue::Text(s) => Condition::matches(c.field, s),
                FieldValue::AnyText(options) => Condition::matches(c.field, options),
            })
            .collect()
    };
    Filter {
        must: convert(filter.must),
        must_not: convert(filter.must_not),
        ..Filter::default()
    }
}

fn id_string(id: Option<PointId>) -> String {
    match id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(uuid)) => uuid,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

fn from_qdrant_value(value: qdrant_client::qdrant::Value) -> Option<serde_json::Value> {
    use serde_json::Value as Json;
    Some(match value.kind? {
        Kind::StringValue(s) => Json::String(s),
        Kind::IntegerValue(n) => Json::from(n),
        Kind::DoubleValue(d) => Json::Number(serde_json::Number::from_f64(d)?),
        Kind::BoolValue(b) => Json::Bool(b),
        Kind::ListValue(list) => {
            Json::Array(list.values.into_iter().filter_map(from_qdrant_value).collect())
        }
        Kind::StructValue(inner) => Json::Object(
            inner
                .fields
                .into_iter()
                .filter_map(|(k, v)| Some((k, from_qdrant_value(v)?)))
                .collect(),
        ),
        Kind::NullValue(_) => Json::Null,
    })
}

fn from_qdrant_payload(
    payload: HashMap<String, qdrant_client::qdrant::Value>,
) -> HashMap<String, serde_json::Value> {
    payload
        .into_iter()
        .filter_map(|(k, v)| Some((k, from_qdrant_value(v)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_builds_lazily() {
        let ops = QdrantOps::new("http://localhost:6334").unwrap();
        assert_eq!(ops.backend_name(), "qdrant");
        assert!(format!("{ops:?}").contains("QdrantOps"));
        assert!(QdrantOps::new("not a valid url").is_err());
    }

    #[test]
    fn chunk_payload_survives_conversion() {
        let payload = HashMap::from([
            ("file_path".to_owned(), json!("src/lib.rs")),
            ("start_line".to_owned(), json!(3)),
            ("deleted".to_owned(), json!(false)),
        ]);
        let back = from_qdrant_payload(to_qdrant_payload(payload.clone()).unwrap());
        assert_eq!(back, payload);
    }

    #[test]
    fn filter_keeps_both_clauses() {
        let filter = VectorFilter {
            must: vec![
                FieldCondition {
                    field: "language".into(),
                    value: FieldValue::AnyText(vec!["rust".into(), "go".into()]),
                },
                FieldCondition {
                    field: "start_line".into(),
                    value: FieldValue::Integer(1),
                },
            ],
            must_not: vec![FieldCondition::text("chunk_type", "comment")],
        };
        let f = to_qdrant_filter(filter);
        assert_eq!(f.must.len(), 2);
        assert_eq!(f.must_not.len(), 1);
    }

    #[test]
    fn point_ids_render_as_strings() {
        assert_eq!(id_string(Some(PointId::from(42u64))), "42");
        let uuid = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(id_string(Some(PointId::from(uuid.to_owned()))), uuid);
        assert_eq!(id_string(None), "");
    }
}

//! Qdrant-backed [`VectorStore`].

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use qdrant_client::Qdrant;
use qdrant_client::qdrant::vectors_output::VectorsOptions;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder,
    Distance, FieldType, Filter, GetPointsBuilder, ListValue, PointId as QdrantPointId,
    PointStruct, PointsIdsList, RetrievedPoint, ScoredPoint, SearchPointsBuilder, Struct,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder, VectorsOutput, value::Kind,
};

use crate::payload::{PointId, sanitize_payload};
use crate::vector_store::{
    FieldCondition, FieldValue, RetrievedVector, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError,
};

type QdrantResult<T> = Result<T, Box<qdrant_client::QdrantError>>;
type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Payload fields indexed as keywords so filtered searches stay fast.
const KEYWORD_FIELDS: [&str; 2] = ["repository_id", "chunk_id"];

/// Thin wrapper over the [`Qdrant`] client; every call is bounded by `timeout`.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
    timeout: Duration,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a new `QdrantOps` connected to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the Qdrant client cannot be created.
    pub fn new(url: &str, timeout: Duration) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url)
            .timeout(timeout)
            .build()
            .map_err(Box::new)?;
        Ok(Self { client, timeout })
    }

    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        collection: &str,
        fut: F,
    ) -> Result<T, VectorStoreError>
    where
        F: Future<Output = QdrantResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                tracing::warn!(operation, collection, error = %e, "qdrant call failed");
                VectorStoreError::transport(operation, collection, e)
            }),
            Err(_) => Err(VectorStoreError::Timeout {
                operation,
                collection: collection.to_owned(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn ensure_collection(&self, collection: &str, dimension: u64) -> QdrantResult<()> {
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
                    .vectors_config(VectorParamsBuilder::new(dimension, Distance::Cosine)),
            )
            .await
            .map_err(Box::new)?;
        for field in KEYWORD_FIELDS {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(Box::new)?;
        }
        tracing::info!(collection, dimension, "created qdrant collection");
        Ok(())
    }
}

fn to_qdrant_id(id: PointId) -> QdrantPointId {
    match id {
        PointId::Uuid(u) => QdrantPointId::from(u),
        PointId::Num(n) => QdrantPointId::from(n),
    }
}

fn parse_ids(ids: Vec<String>) -> Result<Vec<QdrantPointId>, VectorStoreError> {
    ids.iter()
        .map(|id| PointId::parse(id).map(to_qdrant_id))
        .collect()
}

fn id_to_string(id: Option<QdrantPointId>) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.and_then(|pid| pid.point_id_options) {
        Some(PointIdOptions::Uuid(u)) => u,
        Some(PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    }
}

pub(crate) fn json_to_qdrant(value: serde_json::Value) -> QdrantValue {
    use serde_json::Value;
    let kind = match value {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Kind::IntegerValue(i),
            None => Kind::DoubleValue(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Kind::StringValue(s),
        Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_qdrant).collect(),
        }),
        Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, json_to_qdrant(v)))
                .collect(),
        }),
    };
    QdrantValue { kind: Some(kind) }
}

pub(crate) fn qdrant_to_json(value: QdrantValue) -> serde_json::Value {
    use serde_json::Value;
    match value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::IntegerValue(i)) => Value::Number(i.into()),
        Some(Kind::DoubleValue(d)) => {
            serde_json::Number::from_f64(d).map_or(Value::Null, Value::Number)
        }
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::ListValue(list)) => {
            Value::Array(list.values.into_iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(s)) => Value::Object(
            s.fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_to_json(v)))
                .collect(),
        ),
    }
}

fn payload_to_json(payload: HashMap<String, QdrantValue>) -> HashMap<String, serde_json::Value> {
    payload
        .into_iter()
        .map(|(k, v)| (k, qdrant_to_json(v)))
        .collect()
}

fn vector_filter_to_qdrant(filter: VectorFilter) -> Filter {
    Filter {
        must: filter
            .must
            .into_iter()
            .map(field_condition_to_qdrant)
            .collect(),
        must_not: filter
            .must_not
            .into_iter()
            .map(field_condition_to_qdrant)
            .collect(),
        ..Filter::default()
    }
}

fn field_condition_to_qdrant(cond: FieldCondition) -> Condition {
    match cond.value {
        FieldValue::Integer(v) => Condition::matches(cond.field, v),
        FieldValue::Text(v) => Condition::matches(cond.field, v),
    }
}

fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    ScoredVectorPoint {
        id: id_to_string(point.id),
        score: point.score,
        payload: payload_to_json(point.payload),
    }
}

#[allow(deprecated)]
fn dense_vector(vectors: Option<VectorsOutput>) -> Vec<f32> {
    match vectors.and_then(|v| v.vectors_options) {
        Some(VectorsOptions::Vector(v)) => v.data,
        _ => Vec::new(),
    }
}

fn retrieved_point_to_vector(point: RetrievedPoint) -> RetrievedVector {
    RetrievedVector {
        id: id_to_string(point.id),
        vector: dense_vector(point.vectors),
        payload: payload_to_json(point.payload),
    }
}

impl VectorStore for QdrantOps {
    fn create_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.bounded(
                "create_collection",
                &collection,
                self.ensure_collection(&collection, dimension),
            )
            .await
        })
    }

    fn exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.bounded("exists", &collection, async {
                self.client
                    .collection_exists(&collection)
                    .await
                    .map_err(Box::new)
            })
            .await
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let mut qdrant_points = Vec::with_capacity(points.len());
            for p in points {
                let id = to_qdrant_id(PointId::parse(&p.id)?);
                let payload: HashMap<String, QdrantValue> = sanitize_payload(p.payload)
                    .into_iter()
                    .map(|(k, v)| (k, json_to_qdrant(v)))
                    .collect();
                qdrant_points.push(PointStruct::new(id, p.vector, payload));
            }
            let count = qdrant_points.len();
            self.bounded("upsert", &collection, async {
                self.client
                    .upsert_points(UpsertPointsBuilder::new(&collection, qdrant_points).wait(true))
                    .await
                    .map_err(Box::new)
            })
            .await?;
            tracing::debug!(collection = %collection, count, "upserted points");
            Ok(())
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        include_payload: bool,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut builder = SearchPointsBuilder::new(&collection, vector, limit)
                .with_payload(include_payload);
            if let Some(f) = filter {
                builder = builder.filter(vector_filter_to_qdrant(f));
            }
            let response = self
                .bounded("search", &collection, async {
                    self.client.search_points(builder).await.map_err(Box::new)
                })
                .await?;
            Ok(response
                .result
                .into_iter()
                .map(scored_point_to_vector)
                .collect())
        })
    }

    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let ids = parse_ids(ids)?;
            if ids.is_empty() {
                return Ok(());
            }
            self.bounded("delete", &collection, async {
                self.client
                    .delete_points(
                        DeletePointsBuilder::new(&collection)
                            .points(PointsIdsList { ids })
                            .wait(true),
                    )
                    .await
                    .map_err(Box::new)
            })
            .await?;
            Ok(())
        })
    }

    fn retrieve(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<RetrievedVector>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let ids = parse_ids(ids)?;
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let response = self
                .bounded("retrieve", &collection, async {
                    self.client
                        .get_points(
                            GetPointsBuilder::new(&collection, ids)
                                .with_vectors(true)
                                .with_payload(true),
                        )
                        .await
                        .map_err(Box::new)
                })
                .await?;
            Ok(response
                .result
                .into_iter()
                .map(retrieved_point_to_vector)
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_valid_url() {
        assert!(QdrantOps::new("http://localhost:6334", Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn debug_format() {
        let ops = QdrantOps::new("http://localhost:6334", Duration::from_secs(5)).unwrap();
        let dbg = format!("{ops:?}");
        assert!(dbg.contains("QdrantOps"));
    }

    #[test]
    fn json_round_trips_through_qdrant_values() {
        let value = serde_json::json!({
            "file_path": "src/main.rs",
            "start_line": 21,
            "symbols": ["main", "run"],
            "meta": {"ratio": 0.5, "flag": true, "none": null}
        });
        let back = qdrant_to_json(json_to_qdrant(value.clone()));
        assert_eq!(back, value);
    }

    #[test]
    fn lists_become_list_values() {
        let v = json_to_qdrant(serde_json::json!([1, "a"]));
        let Some(Kind::ListValue(list)) = v.kind else {
            panic!("expected list value");
        };
        assert_eq!(list.values.len(), 2);
    }

    #[test]
    fn parse_ids_rejects_invalid() {
        let err = parse_ids(vec!["not-an-id".into()]).unwrap_err();
        assert!(matches!(err, VectorStoreError::InvalidPointId(_)));
    }

    #[test]
    fn parse_ids_accepts_mixed() {
        let ids = parse_ids(vec![
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8".into(),
            "7".into(),
        ])
        .unwrap();
        assert_eq!(id_to_string(Some(ids[0].clone())), "6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert_eq!(id_to_string(Some(ids[1].clone())), "7");
    }

    #[test]
    fn filter_conversion_keeps_must_not() {
        let f = vector_filter_to_qdrant(
            VectorFilter::default()
                .must_text("repository_id", "r1")
                .must_not_text("chunk_id", "c1"),
        );
        assert_eq!(f.must.len(), 1);
        assert_eq!(f.must_not.len(), 1);
    }
}

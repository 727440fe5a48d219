use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;

use crate::payload::{PointId, sanitize_payload};
use crate::vector_store::{
    FieldValue, RetrievedVector, ScoredVectorPoint, VectorFilter, VectorPoint, VectorStore,
    VectorStoreError,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct StoredPoint {
    vector: Vec<f32>,
    payload: HashMap<String, serde_json::Value>,
}

struct InMemoryCollection {
    dimension: u64,
    points: HashMap<String, StoredPoint>,
}

/// Process-local vector index with brute-force cosine search.
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, InMemoryCollection>>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Number of points stored in `collection`, or 0 if it does not exist.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .ok()
            .and_then(|cols| cols.get(collection).map(|c| c.points.len()))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorStore")
            .finish_non_exhaustive()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn matches_filter(payload: &HashMap<String, serde_json::Value>, filter: &VectorFilter) -> bool {
    for cond in &filter.must {
        let Some(val) = payload.get(&cond.field) else {
            return false;
        };
        if !field_matches(val, &cond.value) {
            return false;
        }
    }
    for cond in &filter.must_not {
        if let Some(val) = payload.get(&cond.field)
            && field_matches(val, &cond.value)
        {
            return false;
        }
    }
    true
}

fn field_matches(val: &serde_json::Value, expected: &FieldValue) -> bool {
    match expected {
        FieldValue::Integer(i) => val.as_i64() == Some(*i),
        FieldValue::Text(s) => val.as_str() == Some(s.as_str()),
    }
}

fn normalize_ids(ids: &[String]) -> Result<Vec<String>, VectorStoreError> {
    ids.iter()
        .map(|id| PointId::parse(id).map(|p| p.to_string()))
        .collect()
}

fn lock_error(operation: &'static str, collection: &str, e: impl ToString) -> VectorStoreError {
    VectorStoreError::transport(operation, collection, e)
}

impl VectorStore for InMemoryVectorStore {
    fn create_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut cols = self
                .collections
                .write()
                .map_err(|e| lock_error("create_collection", &collection, e))?;
            cols.entry(collection)
                .or_insert_with(|| InMemoryCollection {
                    dimension,
                    points: HashMap::new(),
                });
            Ok(())
        })
    }

    fn exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let cols = self
                .collections
                .read()
                .map_err(|e| lock_error("exists", &collection, e))?;
            Ok(cols.contains_key(&collection))
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let mut normalized = Vec::with_capacity(points.len());
            for p in points {
                let id = PointId::parse(&p.id)?.to_string();
                normalized.push((id, p.vector, sanitize_payload(p.payload)));
            }
            let mut cols = self
                .collections
                .write()
                .map_err(|e| lock_error("upsert", &collection, e))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::CollectionNotFound(collection.clone()))?;
            if let Some((id, vector, _)) = normalized
                .iter()
                .find(|(_, v, _)| v.len() as u64 != col.dimension)
            {
                return Err(VectorStoreError::transport(
                    "upsert",
                    &collection,
                    format!(
                        "point {id} has dimension {}, expected {}",
                        vector.len(),
                        col.dimension
                    ),
                ));
            }
            for (id, vector, payload) in normalized {
                col.points.insert(id, StoredPoint { vector, payload });
            }
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
            let cols = self
                .collections
                .read()
                .map_err(|e| lock_error("search", &collection, e))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::CollectionNotFound(collection.clone()))?;

            let empty_filter = VectorFilter::default();
            let f = filter.as_ref().unwrap_or(&empty_filter);

            let mut scored: Vec<ScoredVectorPoint> = col
                .points
                .iter()
                .filter(|(_, sp)| matches_filter(&sp.payload, f))
                .map(|(id, sp)| ScoredVectorPoint {
                    id: id.clone(),
                    score: cosine_similarity(&vector, &sp.vector),
                    payload: if include_payload {
                        sp.payload.clone()
                    } else {
                        HashMap::new()
                    },
                })
                .collect();

            scored.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            scored.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(scored)
        })
    }

    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let ids = normalize_ids(&ids)?;
            if ids.is_empty() {
                return Ok(());
            }
            let mut cols = self
                .collections
                .write()
                .map_err(|e| lock_error("delete", &collection, e))?;
            let col = cols
                .get_mut(&collection)
                .ok_or_else(|| VectorStoreError::CollectionNotFound(collection.clone()))?;
            for id in &ids {
                col.points.remove(id);
            }
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
            let ids = normalize_ids(&ids)?;
            let cols = self
                .collections
                .read()
                .map_err(|e| lock_error("retrieve", &collection, e))?;
            let col = cols
                .get(&collection)
                .ok_or_else(|| VectorStoreError::CollectionNotFound(collection.clone()))?;
            Ok(ids
                .into_iter()
                .filter_map(|id| {
                    col.points.get(&id).map(|sp| RetrievedVector {
                        vector: sp.vector.clone(),
                        payload: sp.payload.clone(),
                        id,
                    })
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{Payload, PayloadValue};

    const A: &str = "00000000-0000-0000-0000-00000000000a";
    const B: &str = "00000000-0000-0000-0000-00000000000b";

    fn point(id: &str, vector: Vec<f32>, repo: &str) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            payload: Payload::from([("repository_id".to_owned(), PayloadValue::from(repo))]),
        }
    }

    #[tokio::test]
    async fn create_collection_and_exists() {
        let store = InMemoryVectorStore::new();
        assert!(!store.exists("test").await.unwrap());
        store.create_collection("test", 3).await.unwrap();
        assert!(store.exists("test").await.unwrap());
    }

    #[tokio::test]
    async fn create_collection_idempotent() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert("test", vec![point(A, vec![1.0, 0.0, 0.0], "r")])
            .await
            .unwrap();
        store.create_collection("test", 3).await.unwrap();
        assert_eq!(store.len("test"), 1);
    }

    #[tokio::test]
    async fn upsert_and_search() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert(
                "test",
                vec![
                    point(A, vec![1.0, 0.0, 0.0], "r"),
                    point(B, vec![0.0, 1.0, 0.0], "r"),
                ],
            )
            .await
            .unwrap();

        let results = store
            .search("test", vec![1.0, 0.0, 0.0], 2, true, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, A);
        assert!((results[0].score - 1.0).abs() < f32::EPSILON);
        assert_eq!(results[0].payload["repository_id"], "r");
    }

    #[tokio::test]
    async fn search_without_payload_omits_it() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert("test", vec![point(A, vec![1.0, 0.0, 0.0], "r")])
            .await
            .unwrap();
        let results = store
            .search("test", vec![1.0, 0.0, 0.0], 1, false, None)
            .await
            .unwrap();
        assert!(results[0].payload.is_empty());
    }

    #[tokio::test]
    async fn reupsert_replaces_point() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert("test", vec![point(A, vec![1.0, 0.0, 0.0], "old")])
            .await
            .unwrap();
        store
            .upsert("test", vec![point(A, vec![0.0, 1.0, 0.0], "new")])
            .await
            .unwrap();
        assert_eq!(store.len("test"), 1);
        let got = store.retrieve("test", vec![A.into()]).await.unwrap();
        assert_eq!(got[0].vector, vec![0.0, 1.0, 0.0]);
        assert_eq!(got[0].payload["repository_id"], "new");
    }

    #[tokio::test]
    async fn search_with_filter() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert(
                "test",
                vec![
                    point(A, vec![1.0, 0.0, 0.0], "r1"),
                    point(B, vec![0.9, 0.1, 0.0], "r2"),
                ],
            )
            .await
            .unwrap();

        let filter = VectorFilter::default().must_text("repository_id", "r2");
        let results = store
            .search("test", vec![1.0, 0.0, 0.0], 10, true, Some(filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, B);
    }

    #[tokio::test]
    async fn delete_normalizes_and_removes() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        store
            .upsert("test", vec![point(A, vec![1.0, 0.0, 0.0], "r")])
            .await
            .unwrap();
        store
            .delete("test", vec![A.to_uppercase()])
            .await
            .unwrap();
        assert!(store.is_empty("test"));
    }

    #[tokio::test]
    async fn delete_rejects_invalid_id() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        let err = store.delete("test", vec!["nope".into()]).await.unwrap_err();
        assert!(matches!(err, VectorStoreError::InvalidPointId(_)));
    }

    #[tokio::test]
    async fn upsert_rejects_wrong_dimension_as_batch() {
        let store = InMemoryVectorStore::new();
        store.create_collection("test", 3).await.unwrap();
        let err = store
            .upsert(
                "test",
                vec![point(A, vec![1.0, 0.0, 0.0], "r"), point(B, vec![1.0], "r")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
        assert!(store.is_empty("test"));
    }

    #[tokio::test]
    async fn missing_collection_is_reported() {
        let store = InMemoryVectorStore::new();
        let err = store
            .search("missing", vec![1.0], 1, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::CollectionNotFound(_)));
    }

    #[test]
    fn cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &b)).abs() < f32::EPSILON);
    }

    #[test]
    fn debug_format() {
        let store = InMemoryVectorStore::new();
        let dbg = format!("{store:?}");
        assert!(dbg.contains("InMemoryVectorStore"));
    }
}

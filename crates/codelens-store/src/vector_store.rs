use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::payload::Payload;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("{operation} on collection {collection} failed: {message}")]
    Transport {
        operation: &'static str,
        collection: String,
        message: String,
    },
    #[error("{operation} on collection {collection} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        collection: String,
        seconds: u64,
    },
    #[error("collection not found: {0}")]
    CollectionNotFound(String),
    #[error("invalid point id: {0:?}")]
    InvalidPointId(String),
}

impl VectorStoreError {
    pub(crate) fn transport(
        operation: &'static str,
        collection: &str,
        message: impl ToString,
    ) -> Self {
        Self::Transport {
            operation,
            collection: collection.to_owned(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl VectorFilter {
    #[must_use]
    pub fn must_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(FieldCondition {
            field: field.into(),
            value: FieldValue::Text(value.into()),
        });
        self
    }

    #[must_use]
    pub fn must_not_text(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must_not.push(FieldCondition {
            field: field.into(),
            value: FieldValue::Text(value.into()),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub score: f32,
    /// Empty when the search was issued without `include_payload`.
    pub payload: HashMap<String, serde_json::Value>,
}

/// A stored point fetched by id, including its vector.
#[derive(Debug, Clone)]
pub struct RetrievedVector {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations the pipeline and retrieval engine invoke on a vector index.
///
/// Batches succeed or fail as a whole and implementations never retry.
pub trait VectorStore: Send + Sync {
    /// Create a cosine-distance collection. No-op if it already exists.
    fn create_collection(
        &self,
        collection: &str,
        dimension: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    /// Insert or replace points by id.
    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        include_payload: bool,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    /// Delete points by id. Ids must be UUIDs or unsigned integers.
    fn delete(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Fetch points with their vectors. Unknown ids are omitted.
    fn retrieve(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<Vec<RetrievedVector>, VectorStoreError>>;
}

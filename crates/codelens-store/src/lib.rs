//! Chunk, session and vector persistence: `SQLite` with an FTS5 text index,
//! Qdrant for vectors, and in-memory variants of both.

pub mod document_store;
pub mod error;
pub mod in_memory_document;
pub mod in_memory_store;
pub mod payload;
pub mod qdrant_ops;
pub mod sqlite;
pub mod types;
pub mod vector_store;

pub use document_store::DocumentStore;
pub use error::StoreError;
pub use in_memory_document::InMemoryDocumentStore;
pub use in_memory_store::InMemoryVectorStore;
pub use payload::{Payload, PayloadValue, PointId, sanitize_payload};
pub use qdrant_ops::QdrantOps;
pub use sqlite::SqliteStore;
pub use types::{
    ChatMessage, ChatSession, ChunkRef, CodeChunk, Repository, SourceFile, TextHit,
};
pub use vector_store::{
    FieldCondition, FieldValue, RetrievedVector, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError,
};

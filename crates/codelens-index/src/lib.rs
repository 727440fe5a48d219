//! Repository indexing for codelens.
//!
//! Files are split into overlapping line windows, embedded through a bounded
//! job queue and worker pool, and searched by vector similarity, text rank or
//! a weighted fusion of both.

pub mod chunker;
pub mod context;
pub mod error;
pub mod fusion;
pub mod importer;
pub mod languages;
pub mod pipeline;
pub mod queue;
pub mod retriever;
pub mod status;
pub mod symbols;

pub use chunker::{ChunkerConfig, chunk_file};
pub use error::{IndexError, Result};
pub use importer::{ImportReport, import_directory};
pub use languages::{Lang, detect_language};
pub use pipeline::{EmbeddingPipeline, OverflowPolicy, PipelineConfig, QueueOutcome};
pub use queue::EmbeddingJob;
pub use retriever::{HybridRetriever, RetrievalConfig, SearchResult};
pub use status::{EmbeddingState, EmbeddingStatus, ProcessingStats, StatusTracker};

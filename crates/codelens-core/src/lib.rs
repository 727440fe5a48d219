//! Configuration, retrieval-augmented chat and the `CodeLens` service facade.

pub mod bootstrap;
pub mod chat;
pub mod config;
pub mod error;
pub mod service;

pub use chat::{ChatOrchestrator, ChatSettings, ResponseStream, StreamChunk};
pub use config::{Config, ProviderKind};
pub use error::{ChatError, ConfigError};
pub use service::CodeLens;

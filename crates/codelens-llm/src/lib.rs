//! Embedding and completion provider abstraction.
//!
//! The pipeline needs exactly two things from a model backend: a batch
//! embedding call (one vector per input text) and a completion call that can
//! either return the whole answer or stream incremental text deltas.

pub mod any;
pub mod error;
pub(crate) mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod openai;
pub mod provider;
pub(crate) mod retry;
pub(crate) mod sse;

pub use error::LlmError;
pub use provider::{ChatStream, LlmProvider, Message, Role};

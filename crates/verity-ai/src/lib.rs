//! verity-ai: clients for the services behind the answering loop
//!
//! This crate wraps an OpenAI-compatible chat completion API (streaming and
//! structured output), its embeddings endpoint, and the Qdrant REST search
//! API. Nothing here knows about retrieval-augmented answering itself.

pub mod error;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::MessageEventStream;
pub use types::*;

//! Collaborators backed by real services

pub mod llm;
pub mod retriever;

use std::sync::Arc;

use verity_ai::{Model, providers::ChatProvider};

pub use llm::{LlmGenerator, LlmGrader, LlmRewriter};
pub use retriever::{DEFAULT_SOURCE, DEFAULT_TOP_K, QdrantRetriever};

use crate::capability::Retriever;
use crate::workflow::Collaborators;

/// Wire one chat model into every model-backed role
pub fn chat_collaborators(
    provider: Arc<dyn ChatProvider>,
    model: Model,
    retriever: Arc<dyn Retriever>,
) -> Collaborators {
    Collaborators {
        retriever,
        generator: Arc::new(LlmGenerator::new(provider.clone(), model.clone())),
        grader: Arc::new(LlmGrader::new(provider.clone(), model.clone())),
        rewriter: Arc::new(LlmRewriter::new(provider, model)),
    }
}

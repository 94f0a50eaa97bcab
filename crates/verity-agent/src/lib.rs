//! verity-agent: self-correcting retrieval-augmented answering
//!
//! This crate provides the loop that retrieves forum passages, drafts an
//! answer, grades it for groundedness and relevance, and regenerates or
//! rewrites the query until the answer passes or the retry budget runs out.

pub mod adapters;
pub mod capability;
pub mod conversation;
pub mod error;
pub mod events;
pub mod retry;
pub mod routing;
pub mod tool;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use capability::{BinaryScore, Generator, Grade, GradeFields, Grader, QueryRewriter, Retriever, Rubric};
pub use conversation::{Answer, ConversationState, Passage};
pub use error::{Error, Result};
pub use events::{DeltaSink, WorkflowEvent};
pub use retry::{RetryConfig, TRY_AGAIN_MESSAGE};
pub use routing::NextState;
pub use tool::{AnswerTool, Tool, ToolResult};
pub use workflow::{Collaborators, Step, Workflow, WorkflowConfig};

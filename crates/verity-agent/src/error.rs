//! Error types for verity-agent

use std::time::Duration;

use thiserror::Error;

use crate::capability::Rubric;

/// Result type alias using verity-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end an answering turn
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the service client layer
    #[error(transparent)]
    Ai(#[from] verity_ai::Error),

    /// The retriever failed for a reason outside the client layer
    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    /// A grader answered with something other than "yes" or "no"
    #[error("Malformed {rubric} classification: {raw:?}")]
    MalformedClassification { rubric: Rubric, raw: String },

    /// The conversation has no user turn to answer
    #[error("No user question to answer")]
    NoQuestion,

    /// The caller abandoned the turn
    #[error("Turn cancelled")]
    Cancelled,

    /// A turn attempt exceeded the caller's wall-clock bound
    #[error("Turn timed out after {0:?}")]
    Timeout(Duration),

    /// Every caller-level attempt failed
    #[error("Failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<Error> },

    /// Tool arguments did not match the declared schema
    #[error("Invalid tool arguments: {0}")]
    ToolArguments(String),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether replaying the whole turn may succeed.
    ///
    /// Malformed classifications, cancellation and bad input are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Ai(verity_ai::Error::Auth(_) | verity_ai::Error::InvalidApiKey) => false,
            Error::Ai(e) => e.is_retryable() || crate::retry::is_retryable_error(&e.to_string()),
            Error::Retrieval(msg) => crate::retry::is_retryable_error(msg),
            Error::Timeout(_) => true,
            _ => false,
        }
    }
}

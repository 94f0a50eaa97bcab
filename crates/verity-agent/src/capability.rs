//! Collaborator interfaces consumed by the answering loop.
//!
//! The loop never talks to a model or an index directly; it is handed
//! implementations of these traits at construction time.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::Passage;
use crate::error::{Error, Result};
use crate::events::DeltaSink;

/// Semantic search over the passage store
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Passages for `query`, most relevant first
    async fn search(&self, query: &str) -> Result<Vec<Passage>>;
}

/// Answer generation from supporting passages
#[async_trait]
pub trait Generator: Send + Sync {
    /// Produce a candidate answer
    async fn complete(&self, question: &str, passages: &[Passage]) -> Result<String>;

    /// Produce a candidate answer, reporting text as it is produced.
    ///
    /// Default implementation ignores the sink and delegates to `complete()`.
    async fn complete_streaming(
        &self,
        question: &str,
        passages: &[Passage],
        _sink: &DeltaSink,
    ) -> Result<String> {
        self.complete(question, passages).await
    }
}

/// Binary classification against a fixed rubric
#[async_trait]
pub trait Grader: Send + Sync {
    /// Classify the given fields; the label is checked by the caller
    async fn classify(&self, rubric: Rubric, fields: &GradeFields) -> Result<Grade>;
}

/// Retrieval-oriented question rewriting
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, question: &str) -> Result<String>;
}

/// Named inputs handed to a grader
pub type GradeFields = BTreeMap<String, String>;

/// The two grading rubrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rubric {
    /// Is the generation supported by the retrieved facts
    Groundedness,
    /// Does the generation address the question
    AnswerRelevance,
}

impl Rubric {
    /// Field names the rubric's prompt expects
    pub fn field_names(&self) -> &'static [&'static str] {
        match self {
            Rubric::Groundedness => &["documents", "generation"],
            Rubric::AnswerRelevance => &["question", "generation"],
        }
    }
}

impl fmt::Display for Rubric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rubric::Groundedness => f.write_str("groundedness"),
            Rubric::AnswerRelevance => f.write_str("answer relevance"),
        }
    }
}

/// Raw grader output, shaped like the structured-output schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    pub binary_score: String,
}

impl Grade {
    pub fn new(binary_score: impl Into<String>) -> Self {
        Self {
            binary_score: binary_score.into(),
        }
    }

    /// Interpret the label, rejecting anything but yes/no
    pub fn score(&self, rubric: Rubric) -> Result<BinaryScore> {
        BinaryScore::parse(&self.binary_score).ok_or_else(|| Error::MalformedClassification {
            rubric,
            raw: self.binary_score.clone(),
        })
    }
}

/// A validated grader verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryScore {
    Yes,
    No,
}

impl BinaryScore {
    /// Parse "yes"/"no", ignoring case and surrounding whitespace
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.eq_ignore_ascii_case("yes") {
            Some(BinaryScore::Yes)
        } else if label.eq_ignore_ascii_case("no") {
            Some(BinaryScore::No)
        } else {
            None
        }
    }

    pub fn is_yes(self) -> bool {
        self == BinaryScore::Yes
    }
}

/// Render passages as the facts block given to graders and generators
pub fn format_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

//! Chat-model backed generator, graders and query rewriter.

use std::sync::Arc;

use async_trait::async_trait;
use verity_ai::{
    CompletionOptions, Context, Message, Model, providers::ChatProvider, stream::collect_message,
};

use crate::capability::{
    Generator, Grade, GradeFields, Grader, QueryRewriter, Rubric, format_passages,
};
use crate::conversation::Passage;
use crate::error::{Error, Result};
use crate::events::DeltaSink;

const GENERATE_SYSTEM: &str = "You are an assistant for question-answering tasks. \
Use the retrieved context below, which holds earlier answers written by medical \
professionals, to answer the question. If the context does not contain the answer, \
say that you don't know. Use three sentences maximum and keep the answer concise.";

const GROUNDEDNESS_SYSTEM: &str = "You are a grader assessing whether an LLM generation \
is grounded in and supported by a set of retrieved facts.\n\
Give a binary score 'yes' or 'no'. 'yes' means the generation is supported by the facts.";

const RELEVANCE_SYSTEM: &str = "You are a grader assessing whether an answer addresses \
and resolves a question.\n\
Give a binary score 'yes' or 'no'. 'yes' means the answer resolves the question.";

const REWRITE_SYSTEM: &str = "You rewrite questions into a better version for vector \
store retrieval. Reason about the underlying semantic intent of the input and keep \
its language. Reply with the rewritten question only.";

fn generation_prompt(question: &str, passages: &[Passage]) -> String {
    format!(
        "Question: {}\n\nContext: {}\n\nAnswer:",
        question,
        format_passages(passages)
    )
}

fn field<'a>(rubric: Rubric, fields: &'a GradeFields, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Other(format!("missing '{}' for {} grading", name, rubric)))
}

/// Render the user turn for a rubric
fn grading_prompt(rubric: Rubric, fields: &GradeFields) -> Result<String> {
    let generation = field(rubric, fields, "generation")?;
    Ok(match rubric {
        Rubric::Groundedness => format!(
            "Set of facts: \n\n {} \n\n LLM generation: {}",
            field(rubric, fields, "documents")?,
            generation
        ),
        Rubric::AnswerRelevance => format!(
            "User question: \n\n {} \n\n LLM generation: {}",
            field(rubric, fields, "question")?,
            generation
        ),
    })
}

fn grading_system(rubric: Rubric) -> &'static str {
    match rubric {
        Rubric::Groundedness => GROUNDEDNESS_SYSTEM,
        Rubric::AnswerRelevance => RELEVANCE_SYSTEM,
    }
}

/// JSON schema the grader's structured output must follow
pub fn grade_schema(rubric: Rubric) -> serde_json::Value {
    let description = match rubric {
        Rubric::Groundedness => "Answer is grounded in the facts, 'yes' or 'no'",
        Rubric::AnswerRelevance => "Answer addresses the question, 'yes' or 'no'",
    };
    serde_json::json!({
        "type": "object",
        "properties": {
            "binary_score": {
                "type": "string",
                "enum": ["yes", "no"],
                "description": description
            }
        },
        "required": ["binary_score"],
        "additionalProperties": false
    })
}

/// Parse structured grader output. Anything that is not a `Grade` object is
/// a malformed classification.
fn parse_grade(rubric: Rubric, raw: &str) -> Result<Grade> {
    serde_json::from_str(raw.trim()).map_err(|_| Error::MalformedClassification {
        rubric,
        raw: raw.to_string(),
    })
}

fn single_turn(system: &str, user: String) -> Context {
    let mut context = Context::with_system(system);
    context.push(Message::user(user));
    context
}

/// Answers from retrieved passages
pub struct LlmGenerator {
    provider: Arc<dyn ChatProvider>,
    model: Model,
    options: CompletionOptions,
}

impl LlmGenerator {
    pub fn new(provider: Arc<dyn ChatProvider>, model: Model) -> Self {
        Self {
            provider,
            model,
            options: CompletionOptions::deterministic(),
        }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn complete(&self, question: &str, passages: &[Passage]) -> Result<String> {
        let context = single_turn(GENERATE_SYSTEM, generation_prompt(question, passages));
        let message = self
            .provider
            .complete(&self.model, &context, &self.options)
            .await?;
        Ok(message.text().to_string())
    }

    async fn complete_streaming(
        &self,
        question: &str,
        passages: &[Passage],
        sink: &DeltaSink,
    ) -> Result<String> {
        let context = single_turn(GENERATE_SYSTEM, generation_prompt(question, passages));
        let stream = self
            .provider
            .stream(&self.model, &context, &self.options)
            .await?;
        let message = collect_message(stream, |delta| sink.send(delta)).await?;
        Ok(message.text().to_string())
    }
}

/// Grades with structured `{"binary_score": ...}` output
pub struct LlmGrader {
    provider: Arc<dyn ChatProvider>,
    model: Model,
}

impl LlmGrader {
    pub fn new(provider: Arc<dyn ChatProvider>, model: Model) -> Self {
        Self { provider, model }
    }
}

#[async_trait]
impl Grader for LlmGrader {
    async fn classify(&self, rubric: Rubric, fields: &GradeFields) -> Result<Grade> {
        let context = single_turn(grading_system(rubric), grading_prompt(rubric, fields)?);
        let options = CompletionOptions::deterministic().with_json_schema("grade", grade_schema(rubric));

        let message = self
            .provider
            .complete(&self.model, &context, &options)
            .await?;
        parse_grade(rubric, message.text())
    }
}

/// Rewrites questions for retrieval
pub struct LlmRewriter {
    provider: Arc<dyn ChatProvider>,
    model: Model,
    options: CompletionOptions,
}

impl LlmRewriter {
    pub fn new(provider: Arc<dyn ChatProvider>, model: Model) -> Self {
        Self {
            provider,
            model,
            options: CompletionOptions::deterministic(),
        }
    }
}

#[async_trait]
impl QueryRewriter for LlmRewriter {
    async fn rewrite(&self, question: &str) -> Result<String> {
        let prompt = format!(
            "Here is the initial question: \n\n {} \n Formulate an improved question.",
            question
        );
        let context = single_turn(REWRITE_SYSTEM, prompt);
        let message = self
            .provider
            .complete(&self.model, &context, &self.options)
            .await?;

        let rewritten = message.text().trim();
        if rewritten.is_empty() {
            tracing::warn!("rewriter returned nothing, keeping the question");
            return Ok(question.to_string());
        }
        Ok(rewritten.to_string())
    }
}

//! Tool surface for the answering loop.
//!
//! Hosts that drive a chat model with tool calls can expose the whole
//! retrieve/generate/grade loop as a single `answer_health_question` tool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use verity_ai::Message;

use crate::conversation::{Answer, ConversationState};
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, run_with_retries, user_message};
use crate::workflow::{Workflow, WorkflowConfig};

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Text to return to the model
    pub content: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Optional structured details (for UI rendering)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ToolResult {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into(),
            is_error: false,
            details: None,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            details: None,
        }
    }

    /// Add details to the result
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A tool as advertised to a chat model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Human-readable label for UI
    fn label(&self) -> &str {
        self.name()
    }

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult;
}

/// Convert a Tool to its API definition
pub fn to_definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}

#[derive(Debug, Deserialize)]
struct AnswerArgs {
    question: String,
    #[serde(default)]
    history: Vec<Message>,
}

/// Answers a health question from the forum index, retrying transient
/// failures of the whole turn.
pub struct AnswerTool {
    workflow: Arc<Workflow>,
    workflow_config: WorkflowConfig,
    retry: RetryConfig,
    validator: Option<jsonschema::Validator>,
}

impl AnswerTool {
    pub fn new(workflow: Arc<Workflow>) -> Self {
        let workflow_config = *workflow.config();
        let validator = match jsonschema::validator_for(&parameters()) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Invalid answer tool schema, skipping validation: {}", e);
                None
            }
        };
        Self {
            workflow,
            workflow_config,
            retry: RetryConfig::default(),
            validator,
        }
    }

    /// Set the caller-level retry policy
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-turn retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.set_max_retries(max_retries);
        self
    }

    pub fn set_max_retries(&mut self, max_retries: u32) {
        self.workflow_config.max_retries = max_retries;
    }

    pub fn max_retries(&self) -> u32 {
        self.workflow_config.max_retries
    }

    /// Run one turn to completion and return the final conversation state.
    ///
    /// Each retry starts again from a fresh state built from `prior` and
    /// `question`.
    pub async fn run_turn(
        &self,
        prior: &[Message],
        question: &str,
        cancel: CancellationToken,
    ) -> Result<ConversationState> {
        if question.trim().is_empty() {
            return Err(Error::NoQuestion);
        }
        run_with_retries(&self.retry, &cancel, |_| {
            let state = ConversationState::new(prior.to_vec(), question);
            self.workflow
                .run_with(state, &self.workflow_config, cancel.clone())
        })
        .await
    }

    /// Answer `question` given the prior conversation
    pub async fn answer(
        &self,
        question: &str,
        prior: &[Message],
        cancel: CancellationToken,
    ) -> Result<Answer> {
        let state = self.run_turn(prior, question, cancel).await?;
        Ok(state.answer())
    }

    fn validate(&self, args: &serde_json::Value) -> Option<String> {
        self.validator
            .as_ref()
            .and_then(|validator| validate_with_validator(args, validator))
    }
}

fn parameters() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "question": {
                "type": "string",
                "minLength": 1,
                "description": "The user's health question"
            },
            "history": {
                "type": "array",
                "description": "Earlier turns of the conversation",
                "items": {
                    "type": "object",
                    "properties": {
                        "role": { "type": "string", "enum": ["system", "user", "assistant"] },
                        "content": { "type": "string" }
                    },
                    "required": ["role", "content"]
                }
            }
        },
        "required": ["question"]
    })
}

#[async_trait]
impl Tool for AnswerTool {
    fn name(&self) -> &str {
        "answer_health_question"
    }

    fn label(&self) -> &str {
        "Health Q&A"
    }

    fn description(&self) -> &str {
        "Answer a health question using expert replies from the health forum. \
         The answer is checked against the retrieved replies before it is returned."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        parameters()
    }

    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        if let Some(err) = self.validate(&arguments) {
            return ToolResult::error(err);
        }
        let args: AnswerArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return ToolResult::error(Error::ToolArguments(e.to_string()).to_string()),
        };

        tracing::debug!(tool_call_id, question = %args.question, "answering");
        match self.run_turn(&args.history, &args.question, cancel).await {
            Ok(state) => {
                let answer = state.answer();
                ToolResult::text(answer.final_answer.clone()).with_details(serde_json::json!({
                    "supporting_passages": answer.supporting_passages,
                    "generations": state.generations(),
                    "question": state.question,
                    "turns": state.messages.len(),
                }))
            }
            Err(e) => {
                tracing::warn!(tool_call_id, error = %e, "answer failed");
                ToolResult::error(user_message(&e))
            }
        }
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedGrader, ScriptedRetriever};
    use std::time::Duration;

    fn tool_for(h: Harness) -> (AnswerTool, Arc<crate::testing::ScriptedRetriever>) {
        let retriever = h.retriever.clone();
        let tool = AnswerTool::new(Arc::new(h.workflow)).with_retry_config(RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..Default::default()
        });
        (tool, retriever)
    }

    #[test]
    fn test_tool_result_text() {
        let r = ToolResult::text("ok");
        assert!(!r.is_error);
        assert_eq!(r.content, "ok");
        assert!(r.details.is_none());
    }

    #[test]
    fn test_tool_result_error() {
        let r = ToolResult::error("bad");
        assert!(r.is_error);
        assert_eq!(r.content, "bad");
    }

    #[tokio::test]
    async fn test_definition_and_answer() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, _) = tool_for(h);

        let def = to_definition(&tool);
        assert_eq!(def.name, "answer_health_question");
        assert_eq!(def.parameters["required"][0], "question");

        let result = tool
            .execute(
                "call_1",
                serde_json::json!({ "question": "ปวดท้องทำอย่างไร" }),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.is_error, "{}", result.content);
        assert_eq!(result.content, "answer 1");
        let details = result.details.unwrap();
        assert_eq!(details["generations"], 1);
        assert_eq!(details["supporting_passages"][0]["source"], "AgnosForum");
    }

    #[tokio::test]
    async fn test_missing_question_rejected() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, retriever) = tool_for(h);

        let result = tool
            .execute("call_1", serde_json::json!({}), CancellationToken::new())
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("validation failed"));
        assert_eq!(retriever.calls(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_reports_path() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, _) = tool_for(h);

        let result = tool
            .execute(
                "call_1",
                serde_json::json!({ "question": "q", "history": "not a list" }),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("/history"));
    }

    #[tokio::test]
    async fn test_history_is_carried_into_turn() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, _) = tool_for(h);

        let state = tool
            .run_turn(
                &[Message::user("เจ็บคอ"), Message::assistant("ดื่มน้ำอุ่น")],
                "มีไข้ด้วย",
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[2].text(), "มีไข้ด้วย");
        assert_eq!(state.messages[3].text(), "answer 1");
    }

    #[tokio::test]
    async fn test_history_arguments_deserialize_into_messages() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, _) = tool_for(h);

        let result = tool
            .execute(
                "call_1",
                serde_json::json!({
                    "question": "มีไข้ด้วย",
                    "history": [
                        { "role": "system", "content": "ตอบสั้นๆ" },
                        { "role": "user", "content": "เจ็บคอ" },
                        { "role": "assistant", "content": "ดื่มน้ำอุ่น" }
                    ]
                }),
                CancellationToken::new(),
            )
            .await;

        assert!(!result.is_error, "{}", result.content);
        let details = result.details.unwrap();
        assert_eq!(details["turns"], 5);
        assert_eq!(details["question"], "มีไข้ด้วย");
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = Harness::new(3, ScriptedRetriever::failing_first(2), ScriptedGrader::passing());
        let (tool, retriever) = tool_for(h);

        let answer = tool
            .answer("q", &[], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(answer.final_answer, "answer 1");
        assert_eq!(retriever.calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_turn_reports_try_again() {
        let h = Harness::new(3, ScriptedRetriever::failing_first(10), ScriptedGrader::passing());
        let (tool, retriever) = tool_for(h);

        let result = tool
            .execute(
                "call_1",
                serde_json::json!({ "question": "q" }),
                CancellationToken::new(),
            )
            .await;

        assert!(result.is_error);
        assert_eq!(result.content, crate::retry::TRY_AGAIN_MESSAGE);
        assert_eq!(retriever.calls(), 3);
    }

    #[tokio::test]
    async fn test_malformed_grade_is_not_retried() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::new(&["sort of"], &[]));
        let (tool, retriever) = tool_for(h);

        let err = tool
            .answer("q", &[], CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MalformedClassification { .. }));
        assert_eq!(retriever.calls(), 1);
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let (tool, _) = tool_for(h);

        let err = tool
            .answer("   ", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoQuestion));
    }
}

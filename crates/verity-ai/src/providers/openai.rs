//! OpenAI Chat Completions and Embeddings API provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::{ChatProvider, EmbeddingProvider, error_from_response, retry_after_secs};
use crate::{
    error::{Error, Result},
    stream::{MessageEvent, MessageEventStream},
    types::{
        AssistantMetadata, CompletionOptions, Context, Message, Model, ResponseFormat, StopReason,
        Usage,
    },
};

/// OpenAI API client
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    embedding_model: String,
    embedding_base_url: String,
}

impl OpenAIProvider {
    /// Default embedding model
    pub const DEFAULT_EMBEDDING_MODEL: &'static str = "text-embedding-3-small";

    /// Create a new OpenAI provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            embedding_model: Self::DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_base_url: Model::OPENAI_BASE_URL.to_string(),
        }
    }

    /// Create from environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Use a shared HTTP client (connection pool, timeouts)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Set the embedding model and the base URL it is served from
    pub fn with_embedding_model(
        mut self,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        self.embedding_model = model.into();
        self.embedding_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self, model: Option<&Model>) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Ok(auth) = format!("Bearer {}", self.api_key).parse() {
            headers.insert(reqwest::header::AUTHORIZATION, auth);
        }

        // Add model-specific headers
        if let Some(model) = model {
            for (key, value) in &model.headers {
                if let (Ok(name), Ok(val)) = (
                    key.parse::<reqwest::header::HeaderName>(),
                    value.parse::<reqwest::header::HeaderValue>(),
                ) {
                    headers.insert(name, val);
                }
            }
        }
        headers
    }

    fn build_request(
        &self,
        model: &Model,
        context: &Context,
        options: &CompletionOptions,
        stream: bool,
    ) -> OpenAIRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = context.system_prompt {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system_prompt.clone(),
            });
        }

        for msg in &context.messages {
            messages.push(OpenAIMessage {
                role: msg.role().to_string(),
                content: msg.text().to_string(),
            });
        }

        let response_format = match &options.response_format {
            ResponseFormat::Text => None,
            ResponseFormat::JsonSchema { name, schema } => Some(serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": name,
                    "strict": true,
                    "schema": schema,
                }
            })),
        };

        OpenAIRequest {
            model: model.id.clone(),
            messages,
            stream,
            stream_options: stream.then(|| StreamOptionsBody {
                include_usage: true,
            }),
            max_tokens: options.max_tokens.or(model.max_tokens),
            temperature: options.temperature,
            response_format,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn stream(
        &self,
        model: &Model,
        context: &Context,
        options: &CompletionOptions,
    ) -> Result<MessageEventStream> {
        let request = self.build_request(model, context, options, true);
        let url = format!("{}/chat/completions", model.base_url);

        let request_builder = self
            .client
            .post(&url)
            .headers(self.headers(Some(model)))
            .json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source, model.clone())))
    }

    async fn complete(
        &self,
        model: &Model,
        context: &Context,
        options: &CompletionOptions,
    ) -> Result<Message> {
        let request = self.build_request(model, context, options, false);
        let url = format!("{}/chat/completions", model.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(Some(model)))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: CompletionResponse = response.json().await?;
        parse_completion(body, &model.id)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.embedding_base_url);
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .headers(self.headers(None))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: EmbeddingResponse = response.json().await?;
        order_embeddings(body, texts.len())
    }
}

fn parse_completion(body: CompletionResponse, model_id: &str) -> Result<Message> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::UnexpectedResponse("completion has no choices".to_string()))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(Error::api("refusal", refusal));
    }

    let usage = body
        .usage
        .map(|u| Usage {
            input: u.prompt_tokens,
            output: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(Message::Assistant {
        content: choice.message.content.unwrap_or_default(),
        metadata: AssistantMetadata {
            model: Some(model_id.to_string()),
            usage,
            stop_reason: StopReason::from_finish_reason(choice.finish_reason.as_deref()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    })
}

/// Embeddings come back tagged with their input index; put them in input order.
fn order_embeddings(body: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if body.data.len() != expected {
        return Err(Error::UnexpectedResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            body.data.len()
        )));
    }

    let mut data = body.data;
    data.sort_by_key(|d| d.index);
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

fn create_stream(
    mut event_source: EventSource,
    model: Model,
) -> impl futures::Stream<Item = MessageEvent> {
    stream! {
        let mut accumulated_text = String::new();
        let mut finish_reason: Option<String> = None;
        let mut usage = Usage::default();

        let start_message = Message::Assistant {
            content: String::new(),
            metadata: AssistantMetadata {
                model: Some(model.id.clone()),
                ..Default::default()
            },
        };
        yield MessageEvent::Start { message: start_message };

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }

                    let chunk: std::result::Result<StreamChunk, _> = serde_json::from_str(&msg.data);
                    match chunk {
                        Ok(chunk) => {
                            for choice in &chunk.choices {
                                if let Some(ref content) = choice.delta.content {
                                    accumulated_text.push_str(content);
                                    yield MessageEvent::TextDelta {
                                        delta: content.clone(),
                                    };
                                }

                                if let Some(ref reason) = choice.finish_reason {
                                    finish_reason = Some(reason.clone());
                                }
                            }

                            // Usage arrives in a final chunk with no choices
                            if let Some(ref stream_usage) = chunk.usage {
                                usage.input = stream_usage.prompt_tokens;
                                usage.output = stream_usage.completion_tokens;
                            }
                        }
                        Err(e) => {
                            yield MessageEvent::Error {
                                message: format!("Failed to parse chunk: {}", e),
                                status: None,
                                retry_after: None,
                            };
                            return;
                        }
                    }
                }
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let retry_after = retry_after_secs(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    yield MessageEvent::Error {
                        message: body,
                        status: Some(status.as_u16()),
                        retry_after,
                    };
                    return;
                }
                Err(e) => {
                    yield MessageEvent::Error {
                        message: format!("SSE error: {}", e),
                        status: None,
                        retry_after: None,
                    };
                    return;
                }
            }
        }
        event_source.close();

        let stop_reason = StopReason::from_finish_reason(finish_reason.as_deref());

        let final_message = Message::Assistant {
            content: accumulated_text,
            metadata: AssistantMetadata {
                model: Some(model.id.clone()),
                usage: usage.clone(),
                stop_reason,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
        };

        yield MessageEvent::Done {
            message: final_message,
            stop_reason: stop_reason.unwrap_or(StopReason::Stop),
            usage,
        };
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptionsBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptionsBody {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

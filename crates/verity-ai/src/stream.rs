//! Streaming event types and utilities

use crate::types::{Message, StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::{Stream, StreamExt};

/// Events emitted during message streaming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Initial message structure
    Start { message: Message },
    /// Text content delta
    TextDelta { delta: String },
    /// Message completed successfully
    Done {
        message: Message,
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Error occurred. `status` is set when the endpoint rejected the
    /// request before streaming began.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error { .. })
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// Accumulates streamed text deltas into the partial response
#[derive(Debug, Default)]
pub struct MessageBuilder {
    text: String,
    usage: Usage,
    stop_reason: Option<StopReason>,
}

impl MessageBuilder {
    /// Create a new message builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming event and update the message state
    pub fn process_event(&mut self, event: &MessageEvent) {
        match event {
            MessageEvent::TextDelta { delta } => self.text.push_str(delta),
            MessageEvent::Done {
                message,
                stop_reason,
                usage,
            } => {
                // The provider's final message is authoritative.
                self.text = message.text().to_string();
                self.stop_reason = Some(*stop_reason);
                self.usage = usage.clone();
            }
            _ => {}
        }
    }

    /// Build the final message
    pub fn build(self) -> Message {
        Message::Assistant {
            content: self.text,
            metadata: crate::types::AssistantMetadata {
                usage: self.usage,
                stop_reason: self.stop_reason,
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        }
    }
}

/// Drain a stream into its final message, invoking `on_delta` for every
/// text fragment along the way.
pub async fn collect_message(
    mut stream: MessageEventStream,
    mut on_delta: impl FnMut(&str) + Send,
) -> crate::Result<Message> {
    let mut builder = MessageBuilder::new();
    let mut finished = false;

    while let Some(event) = stream.next().await {
        builder.process_event(&event);
        match event {
            MessageEvent::TextDelta { ref delta } => on_delta(delta),
            MessageEvent::Done { .. } => {
                finished = true;
                break;
            }
            MessageEvent::Error {
                message,
                status: Some(status),
                retry_after,
            } => return Err(crate::Error::from_status(status, retry_after, &message)),
            MessageEvent::Error { message, .. } => return Err(crate::Error::Sse(message)),
            MessageEvent::Start { .. } => {}
        }
    }

    if !finished {
        return Err(crate::Error::Sse(
            "stream ended before completion".to_string(),
        ));
    }
    Ok(builder.build())
}

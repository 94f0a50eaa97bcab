//! Per-turn conversation state threaded through the answering loop.

use serde::{Deserialize, Serialize};
use verity_ai::Message;

/// A retrieved unit of evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    /// Passage text
    pub content: String,
    /// Where the passage came from (e.g. the forum it was collected from)
    pub source: String,
}

impl Passage {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
        }
    }
}

/// The finalized result of one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub final_answer: String,
    pub supporting_passages: Vec<Passage>,
}

/// State for one user turn.
///
/// Created fresh per incoming user message and dropped after finalization.
/// Only `messages` is meant to outlive the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    /// Chat turns, append-only
    pub messages: Vec<Message>,
    /// Working question, possibly rewritten
    pub question: String,
    /// Passages from the most recent retrieval
    pub documents: Vec<Passage>,
    /// Most recent generated answer
    pub candidate_answer: String,
    /// Generation counter; `None` before the first generation
    pub retries: Option<u32>,
    /// Free-text explanation slot, not filled by the loop
    pub reason: Option<String>,
}

impl ConversationState {
    /// Start a turn from prior history plus the new user question
    pub fn new(prior_messages: Vec<Message>, question: impl Into<String>) -> Self {
        let mut messages = prior_messages;
        messages.push(Message::user(question));
        Self::from_messages(messages)
    }

    /// Start a turn from a message list whose last user turn is the question
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Content of the latest user turn
    pub fn latest_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.text())
    }

    /// Counter value the next generation will record.
    ///
    /// An unset counter counts as -1, so the first generation records 0.
    pub fn next_retries(&self) -> u32 {
        self.retries.map_or(0, |r| r + 1)
    }

    /// Number of generations performed so far
    pub fn generations(&self) -> u32 {
        self.retries.map_or(0, |r| r + 1)
    }

    /// Replace the retrieved passages wholesale
    pub fn set_documents(&mut self, documents: Vec<Passage>) {
        self.documents = documents;
    }

    /// Record a new candidate answer and bump the counter
    pub fn record_generation(&mut self, answer: String) {
        self.retries = Some(self.next_retries());
        self.candidate_answer = answer;
    }

    /// Commit the candidate answer as the assistant's turn
    pub fn finalize(&mut self) {
        self.messages
            .push(Message::assistant(self.candidate_answer.clone()));
    }

    /// Extract the answer and its evidence
    pub fn answer(&self) -> Answer {
        Answer {
            final_answer: self.candidate_answer.clone(),
            supporting_passages: self.documents.clone(),
        }
    }
}

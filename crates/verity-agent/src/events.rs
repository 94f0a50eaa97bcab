//! Workflow event types

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::capability::{BinaryScore, Rubric};
use crate::routing::NextState;

/// Events emitted while a turn moves through the loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A turn started
    TurnStart { turn_id: Uuid, question: String },

    /// Retrieval finished
    Retrieved { query: String, passages: usize },

    /// Generated text arriving during a generation attempt
    AnswerDelta { attempt: u32, delta: String },

    /// A generation attempt finished
    Generated { attempt: u32, retries: u32 },

    /// A grader returned a verdict
    Graded { rubric: Rubric, score: BinaryScore },

    /// The grading decision picked the next state
    Routed { next: NextState, retries: u32 },

    /// The retry budget forced finalization of an imperfect answer
    BudgetExhausted { retries: u32, max_retries: u32 },

    /// The question was rewritten for another retrieval
    QueryRewritten { question: String },

    /// The turn committed its answer
    TurnEnd {
        turn_id: Uuid,
        generations: u32,
        passages: usize,
    },

    /// The turn failed
    Error { turn_id: Uuid, message: String },
}

impl WorkflowEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::TurnEnd { .. } | WorkflowEvent::Error { .. }
        )
    }
}

/// A sender for generation deltas during one attempt.
///
/// Generators use this to emit `AnswerDelta` events while streaming.
#[derive(Clone)]
pub struct DeltaSink {
    tx: broadcast::Sender<WorkflowEvent>,
    attempt: u32,
}

impl DeltaSink {
    /// Create a sink for a specific generation attempt.
    pub fn new(tx: broadcast::Sender<WorkflowEvent>, attempt: u32) -> Self {
        Self { tx, attempt }
    }

    /// Send a text fragment.
    pub fn send(&self, delta: impl Into<String>) {
        let _ = self.tx.send(WorkflowEvent::AnswerDelta {
            attempt: self.attempt,
            delta: delta.into(),
        });
    }
}

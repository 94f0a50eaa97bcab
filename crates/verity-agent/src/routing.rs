//! Routing after a generation has been graded.
//!
//! These are pure functions of the two verdicts and the counter so the policy
//! can be tested without running the loop. Groundedness is always consulted
//! first; relevance only matters once the answer is grounded.

use serde::{Deserialize, Serialize};

use crate::capability::BinaryScore;

/// Where the loop goes after grading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextState {
    /// Regenerate from the same question and passages
    Generate,
    /// Rewrite the question and retrieve again
    TransformQuery,
    /// Commit the current candidate
    Finalize,
}

/// Whether another attempt fits in the budget
fn within_budget(retries: u32, max_retries: u32) -> bool {
    retries < max_retries
}

/// Decision from the groundedness verdict alone.
///
/// `None` means the answer is grounded and relevance must decide.
pub fn on_groundedness(grounded: BinaryScore, retries: u32, max_retries: u32) -> Option<NextState> {
    match grounded {
        BinaryScore::Yes => None,
        BinaryScore::No if within_budget(retries, max_retries) => Some(NextState::Generate),
        BinaryScore::No => Some(NextState::Finalize),
    }
}

/// Decision from the relevance verdict of a grounded answer
pub fn on_relevance(relevant: BinaryScore, retries: u32, max_retries: u32) -> NextState {
    match relevant {
        BinaryScore::Yes => NextState::Finalize,
        BinaryScore::No if within_budget(retries, max_retries) => NextState::TransformQuery,
        BinaryScore::No => NextState::Finalize,
    }
}

/// Full routing table. `relevant` is ignored when the answer is not grounded.
pub fn decide(
    grounded: BinaryScore,
    relevant: BinaryScore,
    retries: u32,
    max_retries: u32,
) -> NextState {
    on_groundedness(grounded, retries, max_retries)
        .unwrap_or_else(|| on_relevance(relevant, retries, max_retries))
}

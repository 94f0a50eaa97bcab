//! The self-correcting answering loop.
//!
//! A turn moves through `Retrieve -> Generate -> GradeDecision` and from there
//! back to `Generate`, through `TransformQuery` to `Retrieve`, or to
//! `Finalize`. Every generation draws from one shared retry budget, so a turn
//! makes at most `max_retries + 1` generation attempts whatever the graders say.
//!
//! Collaborator failures are not handled here. They end the turn and the
//! caller decides whether to replay it from the start (see [`crate::retry`]).

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    capability::{
        BinaryScore, GradeFields, Generator, Grader, QueryRewriter, Retriever, Rubric,
        format_passages,
    },
    conversation::ConversationState,
    error::{Error, Result},
    events::{DeltaSink, WorkflowEvent},
    routing::{self, NextState},
};

/// Loop configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Budget shared by regeneration and query rewriting.
    ///
    /// The first generation does not count, so 3 allows 4 attempts.
    pub max_retries: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Retrieve,
    Generate,
    /// Computed transition, never persisted
    GradeDecision,
    TransformQuery,
    Finalize,
}

impl From<NextState> for Step {
    fn from(next: NextState) -> Self {
        match next {
            NextState::Generate => Step::Generate,
            NextState::TransformQuery => Step::TransformQuery,
            NextState::Finalize => Step::Finalize,
        }
    }
}

/// The services a workflow drives
#[derive(Clone)]
pub struct Collaborators {
    pub retriever: Arc<dyn Retriever>,
    pub generator: Arc<dyn Generator>,
    pub grader: Arc<dyn Grader>,
    pub rewriter: Arc<dyn QueryRewriter>,
}

/// Orchestrates retrieval, generation, grading and rewriting for one turn at
/// a time. Holds no per-turn state, so one instance can serve concurrent turns.
pub struct Workflow {
    config: WorkflowConfig,
    services: Collaborators,
    event_tx: broadcast::Sender<WorkflowEvent>,
}

impl Workflow {
    /// Create a new workflow
    pub fn new(config: WorkflowConfig, services: Collaborators) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            services,
            event_tx,
        }
    }

    /// Subscribe to workflow events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Get the workflow config
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run a turn to `Finalize` with the default configuration
    pub async fn run(&self, state: ConversationState) -> Result<ConversationState> {
        self.run_with(state, &self.config, CancellationToken::new())
            .await
    }

    /// Run a turn with a per-invocation configuration and a cancellation token.
    ///
    /// Cancelling abandons the turn at the next suspension point; the partial
    /// state is dropped.
    pub async fn run_with(
        &self,
        mut state: ConversationState,
        config: &WorkflowConfig,
        cancel: CancellationToken,
    ) -> Result<ConversationState> {
        let turn_id = Uuid::new_v4();
        let span = tracing::info_span!("turn", %turn_id, max_retries = config.max_retries);

        let result = self
            .drive(&mut state, config, &cancel, turn_id)
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                let _ = self.event_tx.send(WorkflowEvent::TurnEnd {
                    turn_id,
                    generations: state.generations(),
                    passages: state.documents.len(),
                });
                Ok(state)
            }
            Err(e) => {
                let _ = self.event_tx.send(WorkflowEvent::Error {
                    turn_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        config: &WorkflowConfig,
        cancel: &CancellationToken,
        turn_id: Uuid,
    ) -> Result<()> {
        state.question = state
            .latest_user_message()
            .ok_or(Error::NoQuestion)?
            .to_string();
        let _ = self.event_tx.send(WorkflowEvent::TurnStart {
            turn_id,
            question: state.question.clone(),
        });

        let mut step = Step::Retrieve;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tracing::debug!(?step, retries = ?state.retries, "entering step");

            step = match step {
                Step::Retrieve => {
                    self.retrieve(state, cancel).await?;
                    Step::Generate
                }
                Step::Generate => {
                    self.generate(state, cancel).await?;
                    Step::GradeDecision
                }
                Step::GradeDecision => self.grade(state, config, cancel).await?.into(),
                Step::TransformQuery => {
                    self.transform_query(state, cancel).await?;
                    Step::Retrieve
                }
                Step::Finalize => {
                    state.finalize();
                    tracing::debug!(
                        generations = state.generations(),
                        passages = state.documents.len(),
                        "turn finalized"
                    );
                    return Ok(());
                }
            };
        }
    }

    async fn retrieve(&self, state: &mut ConversationState, cancel: &CancellationToken) -> Result<()> {
        let documents = cancellable(cancel, self.services.retriever.search(&state.question)).await?;
        tracing::debug!(query = %state.question, passages = documents.len(), "retrieved");

        let _ = self.event_tx.send(WorkflowEvent::Retrieved {
            query: state.question.clone(),
            passages: documents.len(),
        });
        state.set_documents(documents);
        Ok(())
    }

    async fn generate(&self, state: &mut ConversationState, cancel: &CancellationToken) -> Result<()> {
        let attempt = state.generations() + 1;
        let sink = DeltaSink::new(self.event_tx.clone(), attempt);

        let answer = cancellable(
            cancel,
            self.services
                .generator
                .complete_streaming(&state.question, &state.documents, &sink),
        )
        .await?;

        state.record_generation(answer);
        let retries = state.retries.unwrap_or_default();
        tracing::debug!(attempt, retries, "generated");

        let _ = self
            .event_tx
            .send(WorkflowEvent::Generated { attempt, retries });
        Ok(())
    }

    async fn grade(
        &self,
        state: &ConversationState,
        config: &WorkflowConfig,
        cancel: &CancellationToken,
    ) -> Result<NextState> {
        let retries = state.retries.unwrap_or_default();
        let max_retries = config.max_retries;

        let grounded = self
            .classify(Rubric::Groundedness, groundedness_fields(state), cancel)
            .await?;

        let (next, relevant) = match routing::on_groundedness(grounded, retries, max_retries) {
            Some(next) => (next, None),
            None => {
                let relevant = self
                    .classify(Rubric::AnswerRelevance, relevance_fields(state), cancel)
                    .await?;
                (
                    routing::on_relevance(relevant, retries, max_retries),
                    Some(relevant),
                )
            }
        };

        let passed = grounded.is_yes() && relevant.is_some_and(BinaryScore::is_yes);
        if next == NextState::Finalize && !passed {
            tracing::warn!(
                retries,
                max_retries,
                ?grounded,
                ?relevant,
                "retry budget exhausted, finalizing best available answer"
            );
            let _ = self.event_tx.send(WorkflowEvent::BudgetExhausted {
                retries,
                max_retries,
            });
        } else {
            match next {
                NextState::Generate => {
                    tracing::info!(retries, "decision: generation not grounded in documents")
                }
                NextState::TransformQuery => {
                    tracing::info!(retries, "decision: generation does not address question")
                }
                NextState::Finalize => {
                    tracing::info!(retries, "decision: generation addresses question")
                }
            }
        }

        let _ = self.event_tx.send(WorkflowEvent::Routed { next, retries });
        Ok(next)
    }

    async fn classify(
        &self,
        rubric: Rubric,
        fields: GradeFields,
        cancel: &CancellationToken,
    ) -> Result<BinaryScore> {
        let grade = cancellable(cancel, self.services.grader.classify(rubric, &fields)).await?;
        let score = grade.score(rubric)?;
        tracing::debug!(%rubric, ?score, "graded");

        let _ = self.event_tx.send(WorkflowEvent::Graded { rubric, score });
        Ok(score)
    }

    async fn transform_query(
        &self,
        state: &mut ConversationState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rewritten = cancellable(cancel, self.services.rewriter.rewrite(&state.question)).await?;
        tracing::debug!(from = %state.question, to = %rewritten, "query rewritten");

        state.question = rewritten;
        let _ = self.event_tx.send(WorkflowEvent::QueryRewritten {
            question: state.question.clone(),
        });
        Ok(())
    }
}

fn groundedness_fields(state: &ConversationState) -> GradeFields {
    GradeFields::from([
        ("documents".to_string(), format_passages(&state.documents)),
        ("generation".to_string(), state.candidate_answer.clone()),
    ])
}

fn relevance_fields(state: &ConversationState) -> GradeFields {
    GradeFields::from([
        ("question".to_string(), state.question.clone()),
        ("generation".to_string(), state.candidate_answer.clone()),
    ])
}

/// Await a collaborator call unless the turn is cancelled first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Passage;
    use crate::testing::{Harness, ScriptedGrader, ScriptedRetriever};
    use verity_ai::Message;

    fn turn(question: &str) -> ConversationState {
        ConversationState::new(vec![], question)
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_answer_passing_both_grades_finalizes() {
        let retriever = ScriptedRetriever::with_results(vec![vec![
            Passage::new("Title:ปวดหัว\nExpert: พักผ่อนให้เพียงพอ", "AgnosForum"),
            Passage::new("Title:ไมเกรน\nExpert: หลีกเลี่ยงแสงจ้า", "AgnosForum"),
        ]]);
        let h = Harness::new(3, retriever, ScriptedGrader::passing());

        let state = h.workflow.run(turn("ปวดหัวควรทำอย่างไร")).await.unwrap();

        assert_eq!(h.generator.call_count(), 1);
        assert_eq!(state.retries, Some(0));
        assert_eq!(state.documents.len(), 2);
        assert_eq!(state.candidate_answer, "answer 1");
        assert_eq!(h.rewriter.call_count(), 0);
        assert_eq!(h.retriever.calls(), 1);

        let last = state.messages.last().unwrap();
        assert_eq!(last.role(), "assistant");
        assert_eq!(last.text(), "answer 1");
    }

    #[tokio::test]
    async fn test_ungrounded_answers_regenerate_until_grounded() {
        let grader = ScriptedGrader::new(&["no", "no", "no", "yes"], &["yes"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);

        let state = h.workflow.run(turn("q")).await.unwrap();

        assert_eq!(h.generator.call_count(), 4);
        assert_eq!(state.retries, Some(3));
        assert_eq!(state.candidate_answer, "answer 4");
        // Regeneration reuses the same evidence.
        assert_eq!(h.retriever.calls(), 1);
        assert_eq!(h.rewriter.call_count(), 0);
        assert_eq!(h.grader.count(Rubric::AnswerRelevance), 1);
    }

    #[tokio::test]
    async fn test_irrelevant_answers_rewrite_until_budget_then_finalize() {
        let grader = ScriptedGrader::new(&["yes"; 10], &["no"; 10]);
        let h = Harness::new(2, ScriptedRetriever::new(), grader);

        let state = h.workflow.run(turn("q")).await.unwrap();

        assert_eq!(h.generator.call_count(), 3);
        assert_eq!(state.retries, Some(2));
        assert_eq!(h.rewriter.call_count(), 2);
        assert_eq!(h.retriever.calls(), 3);
        assert_eq!(state.question, "q (rewrite 1) (rewrite 2)");
        assert_eq!(state.messages.last().unwrap().text(), "answer 3");
    }

    #[tokio::test]
    async fn test_rewritten_question_drives_next_retrieval_and_generation() {
        let grader = ScriptedGrader::new(&[], &["no"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);

        h.workflow.run(turn("นอนไม่หลับ")).await.unwrap();

        let queries = h.retriever.queries.lock().clone();
        assert_eq!(queries, vec!["นอนไม่หลับ", "นอนไม่หลับ (rewrite 1)"]);

        let seen = h.generator.seen.lock();
        assert_eq!(seen[1].0, "นอนไม่หลับ (rewrite 1)");
    }

    #[tokio::test]
    async fn test_documents_replaced_on_each_retrieval() {
        let grader = ScriptedGrader::new(&[], &["no", "no"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);

        let state = h.workflow.run(turn("q")).await.unwrap();

        assert_eq!(h.retriever.calls(), 3);
        assert_eq!(state.documents.len(), 2);
        assert!(state.documents.iter().all(|p| p.content.starts_with("retrieval 3")));

        // Each generation saw exactly the passages of the retrieval before it.
        let seen = h.generator.seen.lock();
        for (i, (_, passages)) in seen.iter().enumerate() {
            let prefix = format!("retrieval {}", i + 1);
            assert!(passages.iter().all(|p| p.content.starts_with(&prefix)));
        }
    }

    #[tokio::test]
    async fn test_generation_bound_holds_for_any_grader_sequence() {
        const LEN: u32 = 5;
        for max_retries in 0..=3u32 {
            for g in 0..(1u32 << LEN) {
                for r in 0..(1u32 << LEN) {
                    let label = |mask: u32, i: u32| if mask & (1 << i) != 0 { "yes" } else { "no" };
                    let grounded: Vec<&str> = (0..LEN).map(|i| label(g, i)).collect();
                    let relevant: Vec<&str> = (0..LEN).map(|i| label(r, i)).collect();

                    let h = Harness::new(
                        max_retries,
                        ScriptedRetriever::new(),
                        ScriptedGrader::new(&grounded, &relevant),
                    );
                    let state = h.workflow.run(turn("q")).await.unwrap();

                    let generations = h.generator.call_count();
                    assert!(generations >= 1);
                    assert!(generations <= max_retries + 1);
                    assert_eq!(state.retries, Some(generations - 1));
                    assert_eq!(state.messages.len(), 2);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_relevance_not_consulted_for_ungrounded_answer() {
        let grader = ScriptedGrader::new(&["no", "yes"], &["yes"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);

        h.workflow.run(turn("q")).await.unwrap();

        let calls = h.grader.calls.lock();
        let rubrics: Vec<Rubric> = calls.iter().map(|(r, _)| *r).collect();
        assert_eq!(
            rubrics,
            vec![
                Rubric::Groundedness,
                Rubric::Groundedness,
                Rubric::AnswerRelevance
            ]
        );
    }

    #[tokio::test]
    async fn test_grader_fields_follow_rubric() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        h.workflow.run(turn("q")).await.unwrap();

        let calls = h.grader.calls.lock();
        for (rubric, fields) in calls.iter() {
            let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
            let mut expected = rubric.field_names().to_vec();
            expected.sort();
            assert_eq!(keys, expected);
            assert_eq!(fields["generation"], "answer 1");
        }
        assert_eq!(
            calls[0].1["documents"],
            "retrieval 1 passage a\n\nretrieval 1 passage b"
        );
        assert_eq!(calls[1].1["question"], "q");
    }

    #[tokio::test]
    async fn test_malformed_classification_aborts_turn() {
        let grader = ScriptedGrader::new(&["yes"], &["probably"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);
        let mut rx = h.workflow.subscribe();

        let err = h.workflow.run(turn("q")).await.unwrap_err();

        match err {
            Error::MalformedClassification { rubric, raw } => {
                assert_eq!(rubric, Rubric::AnswerRelevance);
                assert_eq!(raw, "probably");
            }
            other => panic!("expected MalformedClassification, got {:?}", other),
        }
        assert_eq!(h.generator.call_count(), 1);
        assert_eq!(h.rewriter.call_count(), 0);

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(WorkflowEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_collaborator_failure_propagates() {
        let h = Harness::new(3, ScriptedRetriever::failing_first(1), ScriptedGrader::passing());
        let err = h.workflow.run(turn("q")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(h.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_question_seeded_from_latest_user_turn() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let state = ConversationState::from_messages(vec![
            Message::user("เจ็บคอ"),
            Message::assistant("ดื่มน้ำอุ่น"),
            Message::user("ถ้ามีไข้ด้วยล่ะ"),
        ]);

        let state = h.workflow.run(state).await.unwrap();

        assert_eq!(h.retriever.queries.lock()[0], "ถ้ามีไข้ด้วยล่ะ");
        assert_eq!(state.messages.len(), 4);
        assert_eq!(state.messages[1].text(), "ดื่มน้ำอุ่น");
    }

    #[tokio::test]
    async fn test_no_user_turn_is_an_error() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let state = ConversationState::from_messages(vec![Message::assistant("hello")]);

        let err = h.workflow.run(state).await.unwrap_err();
        assert!(matches!(err, Error::NoQuestion));
        assert_eq!(h.retriever.calls(), 0);
    }

    #[tokio::test]
    async fn test_per_invocation_budget_override() {
        let grader = ScriptedGrader::new(&["no"; 10], &[]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);

        let state = h
            .workflow
            .run_with(
                turn("q"),
                &WorkflowConfig { max_retries: 1 },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(h.generator.call_count(), 2);
        assert_eq!(state.retries, Some(1));
    }

    #[tokio::test]
    async fn test_cancelled_turn_makes_no_calls() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .workflow
            .run_with(turn("q"), &WorkflowConfig::default(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(h.retriever.calls(), 0);
        assert_eq!(h.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_events_trace_the_turn() {
        let grader = ScriptedGrader::new(&["no", "yes"], &["yes"]);
        let h = Harness::new(3, ScriptedRetriever::new(), grader);
        let mut rx = h.workflow.subscribe();

        h.workflow.run(turn("q")).await.unwrap();
        let events = drain(&mut rx);

        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e {
                WorkflowEvent::TurnStart { .. } => "turn_start",
                WorkflowEvent::Retrieved { .. } => "retrieved",
                WorkflowEvent::AnswerDelta { .. } => "delta",
                WorkflowEvent::Generated { .. } => "generated",
                WorkflowEvent::Graded { .. } => "graded",
                WorkflowEvent::Routed { .. } => "routed",
                WorkflowEvent::BudgetExhausted { .. } => "exhausted",
                WorkflowEvent::QueryRewritten { .. } => "rewritten",
                WorkflowEvent::TurnEnd { .. } => "turn_end",
                WorkflowEvent::Error { .. } => "error",
            })
            .collect();

        assert_eq!(
            kinds,
            vec![
                "turn_start",
                "retrieved",
                "delta",
                "generated",
                "graded",
                "routed",
                "delta",
                "generated",
                "graded",
                "graded",
                "routed",
                "turn_end",
            ]
        );
        assert!(matches!(
            events[5],
            WorkflowEvent::Routed {
                next: NextState::Generate,
                retries: 0
            }
        ));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::TurnEnd { generations: 2, passages: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_reported() {
        let grader = ScriptedGrader::new(&["no"; 10], &[]);
        let h = Harness::new(1, ScriptedRetriever::new(), grader);
        let mut rx = h.workflow.subscribe();

        h.workflow.run(turn("q")).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::BudgetExhausted {
                retries: 1,
                max_retries: 1
            }
        )));
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_independent() {
        let h = Harness::new(3, ScriptedRetriever::new(), ScriptedGrader::passing());

        let (a, b) = tokio::join!(h.workflow.run(turn("a")), h.workflow.run(turn("b")));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.question, "a");
        assert_eq!(b.question, "b");
        assert_eq!(a.retries, Some(0));
        assert_eq!(b.retries, Some(0));
        assert_eq!(h.generator.call_count(), 2);
    }
}

//! Scripted collaborators for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capability::{GradeFields, Generator, Grade, Grader, QueryRewriter, Retriever, Rubric};
use crate::conversation::Passage;
use crate::error::{Error, Result};
use crate::events::DeltaSink;
use crate::workflow::{Collaborators, Workflow, WorkflowConfig};

/// Returns a distinct passage set per call, tagged with the call number.
#[derive(Default)]
pub struct ScriptedRetriever {
    pub queries: Arc<Mutex<Vec<String>>>,
    results: Mutex<VecDeque<Vec<Passage>>>,
    /// Number of leading calls that fail with a transient error
    fail_first: AtomicU32,
}

impl ScriptedRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<Vec<Passage>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            ..Default::default()
        }
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_first: AtomicU32::new(n),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.lock().len()
    }
}

#[async_trait]
impl Retriever for ScriptedRetriever {
    async fn search(&self, query: &str) -> Result<Vec<Passage>> {
        let call = {
            let mut queries = self.queries.lock();
            queries.push(query.to_string());
            queries.len()
        };

        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Ai(verity_ai::Error::RateLimited { retry_after: None }));
        }

        if let Some(scripted) = self.results.lock().pop_front() {
            return Ok(scripted);
        }
        Ok(vec![
            Passage::new(format!("retrieval {} passage a", call), "AgnosForum"),
            Passage::new(format!("retrieval {} passage b", call), "AgnosForum"),
        ])
    }
}

/// Answers "answer N" for the N-th call and records what it was given.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub calls: AtomicU32,
    pub seen: Mutex<Vec<(String, Vec<Passage>)>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn complete(&self, question: &str, passages: &[Passage]) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen
            .lock()
            .push((question.to_string(), passages.to_vec()));
        Ok(format!("answer {}", n))
    }

    async fn complete_streaming(
        &self,
        question: &str,
        passages: &[Passage],
        sink: &DeltaSink,
    ) -> Result<String> {
        let answer = self.complete(question, passages).await?;
        sink.send(answer.clone());
        Ok(answer)
    }
}

/// Plays back a label sequence per rubric, then answers "yes".
#[derive(Default)]
pub struct ScriptedGrader {
    groundedness: Mutex<VecDeque<String>>,
    relevance: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<(Rubric, GradeFields)>>,
}

impl ScriptedGrader {
    pub fn new(groundedness: &[&str], relevance: &[&str]) -> Self {
        Self {
            groundedness: Mutex::new(groundedness.iter().map(|s| s.to_string()).collect()),
            relevance: Mutex::new(relevance.iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Both rubrics always pass
    pub fn passing() -> Self {
        Self::new(&[], &[])
    }

    pub fn count(&self, rubric: Rubric) -> usize {
        self.calls.lock().iter().filter(|(r, _)| *r == rubric).count()
    }
}

#[async_trait]
impl Grader for ScriptedGrader {
    async fn classify(&self, rubric: Rubric, fields: &GradeFields) -> Result<Grade> {
        self.calls.lock().push((rubric, fields.clone()));
        let queue = match rubric {
            Rubric::Groundedness => &self.groundedness,
            Rubric::AnswerRelevance => &self.relevance,
        };
        let label = queue.lock().pop_front().unwrap_or_else(|| "yes".to_string());
        Ok(Grade::new(label))
    }
}

/// Rewrites "q" to "q (rewrite N)".
#[derive(Default)]
pub struct ScriptedRewriter {
    pub calls: AtomicU32,
}

impl ScriptedRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryRewriter for ScriptedRewriter {
    async fn rewrite(&self, question: &str) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{} (rewrite {})", question, n))
    }
}

/// A workflow wired to scripted collaborators, with handles kept for asserts.
pub struct Harness {
    pub workflow: Workflow,
    pub retriever: Arc<ScriptedRetriever>,
    pub generator: Arc<ScriptedGenerator>,
    pub grader: Arc<ScriptedGrader>,
    pub rewriter: Arc<ScriptedRewriter>,
}

impl Harness {
    pub fn new(max_retries: u32, retriever: ScriptedRetriever, grader: ScriptedGrader) -> Self {
        let retriever = Arc::new(retriever);
        let generator = Arc::new(ScriptedGenerator::new());
        let grader = Arc::new(grader);
        let rewriter = Arc::new(ScriptedRewriter::new());

        let workflow = Workflow::new(
            WorkflowConfig { max_retries },
            Collaborators {
                retriever: retriever.clone(),
                generator: generator.clone(),
                grader: grader.clone(),
                rewriter: rewriter.clone(),
            },
        );

        Self {
            workflow,
            retriever,
            generator,
            grader,
            rewriter,
        }
    }
}

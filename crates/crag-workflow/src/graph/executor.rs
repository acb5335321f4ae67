use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crag_core::config::{ModelConfig, WorkflowConfig};
use crag_core::error::{CragError, Result};
use crag_core::event::EventBus;
use crag_core::traits::{EvidenceSource, LlmClient};
use crag_core::types::{RunId, WorkflowEvent};

use super::edge::{transition, Effect, Limits, Outcome};
use super::node::Node;
use super::state::{RunOutcome, RunState, RunStatus};
use crate::generator::AnswerGenerator;
use crate::judge::{GroundednessGrader, Relevance, RelevanceGrader, Router, UtilityGrader};

/// Drives questions through the corrective retrieval graph.
///
/// The engine holds no per-run state; each call to [`WorkflowEngine::run`]
/// creates its own [`RunState`], so one engine can serve many questions
/// concurrently.
pub struct WorkflowEngine {
    router: Router,
    relevance: RelevanceGrader,
    groundedness: GroundednessGrader,
    utility: UtilityGrader,
    generator: AnswerGenerator,
    local: Arc<dyn EvidenceSource>,
    web: Arc<dyn EvidenceSource>,
    config: WorkflowConfig,
    events: Arc<EventBus>,
}

impl WorkflowEngine {
    /// Build an engine whose judges and generator share one model client.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
        topics: Vec<String>,
        local: Arc<dyn EvidenceSource>,
        web: Arc<dyn EvidenceSource>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            router: Router::new(llm.clone(), model.clone(), topics),
            relevance: RelevanceGrader::new(llm.clone(), model.clone()),
            groundedness: GroundednessGrader::new(llm.clone(), model.clone()),
            utility: UtilityGrader::new(llm.clone(), model.clone()),
            generator: AnswerGenerator::new(llm, model),
            local,
            web,
            config,
            events: Arc::new(EventBus::default()),
        }
    }

    /// Publish workflow events on a shared bus.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Answer a question. Adapter, model and timeout errors end the run and
    /// are returned as-is.
    pub async fn run(&self, question: &str) -> Result<RunOutcome> {
        self.run_with_cancel(question, CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), stopping with `Cancelled` once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        question: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let mut state = RunState::new(RunId::new(), question);
        let status = self.drive(&mut state, &cancel).await?;
        Ok(state.into_outcome(status))
    }

    /// Answer a question, reporting failures as an `Unanswerable` outcome
    /// instead of an error.
    pub async fn answer(&self, question: &str) -> RunOutcome {
        self.answer_with_cancel(question, CancellationToken::new()).await
    }

    pub async fn answer_with_cancel(&self, question: &str, cancel: CancellationToken) -> RunOutcome {
        let mut state = RunState::new(RunId::new(), question);
        let status = match self.drive(&mut state, &cancel).await {
            Ok(status) => status,
            Err(e) => RunStatus::Unanswerable {
                error: e.to_string(),
            },
        };
        state.into_outcome(status)
    }

    async fn drive(&self, state: &mut RunState, cancel: &CancellationToken) -> Result<RunStatus> {
        let start = Instant::now();
        let limits = Limits::from(&self.config);

        info!(run_id = %state.run_id, question = %state.question, "Run started");
        self.events.publish(WorkflowEvent::RunStarted {
            run_id: state.run_id.clone(),
            question: state.question.clone(),
        });

        let result = self.walk(state, cancel, limits).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(status) => {
                info!(
                    run_id = %state.run_id,
                    verified = status.is_verified(),
                    retry_count = state.retry_count,
                    requery_count = state.requery_count,
                    elapsed_ms,
                    "Run complete"
                );
                self.events.publish(WorkflowEvent::RunComplete {
                    run_id: state.run_id.clone(),
                    verified: status.is_verified(),
                    transitions: state.trace.len().saturating_sub(1),
                });
            }
            Err(e) => {
                error!(run_id = %state.run_id, node = ?state.trace.last(), error = %e, elapsed_ms, "Run failed");
                self.events.publish(WorkflowEvent::RunError {
                    run_id: state.run_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn walk(
        &self,
        state: &mut RunState,
        cancel: &CancellationToken,
        limits: Limits,
    ) -> Result<RunStatus> {
        let mut node = Node::Route;
        let mut status = RunStatus::Verified;

        loop {
            if cancel.is_cancelled() {
                return Err(CragError::Cancelled);
            }

            state.trace.push(node);
            debug_assert!(state.trace.len() <= limits.max_steps());
            info!(
                run_id = %state.run_id,
                node = %node,
                retry_count = state.retry_count,
                requery_count = state.requery_count,
                "Entering node"
            );
            self.events.publish(WorkflowEvent::NodeEntered {
                run_id: state.run_id.clone(),
                node: node.to_string(),
                retry_count: state.retry_count,
                requery_count: state.requery_count,
            });

            if node.is_terminal() {
                return Ok(status);
            }

            let outcome = self.step(node, state, cancel).await?;
            debug_assert_eq!(outcome.source(), node);
            let next = transition(outcome, state.retry_count, state.requery_count, limits);

            match next.effect {
                Effect::None => {}
                Effect::IncrementRetry => state.retry_count += 1,
                Effect::IncrementRequery => state.requery_count += 1,
                Effect::Exhausted(reason) => status = RunStatus::Unverified { reason },
                Effect::Verified => status = RunStatus::Verified,
            }
            node = next.to;
        }
    }

    /// Run one node under the cancellation token and the optional deadline.
    async fn step(
        &self,
        node: Node,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let work = self.execute(node, state);
        let bounded = async {
            match self.config.node_timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
                    .await
                    .map_err(|_| CragError::NodeTimeout {
                        node: node.to_string(),
                        timeout_secs: secs,
                    })?,
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CragError::Cancelled),
            result = bounded => result,
        }
    }

    async fn execute(&self, node: Node, state: &mut RunState) -> Result<Outcome> {
        match node {
            Node::Route => {
                let decision = self.router.classify(&state.question).await?;
                debug!(run_id = %state.run_id, ?decision, "Routed question");
                Ok(Outcome::Routed(decision))
            }
            Node::RetrieveLocal => {
                state.documents = self.local.fetch(&state.question).await?;
                debug!(
                    run_id = %state.run_id,
                    source = self.local.name(),
                    passages = state.documents.len(),
                    "Retrieved passages"
                );
                Ok(Outcome::Retrieved)
            }
            Node::GradeDocuments => {
                let needs_web_search = self.grade_documents(state).await?;
                Ok(Outcome::Graded { needs_web_search })
            }
            Node::WebSearch => {
                let found = self.web.fetch(&state.question).await?;
                debug!(
                    run_id = %state.run_id,
                    source = self.web.name(),
                    passages = found.len(),
                    "Web search results appended"
                );
                state.documents.extend(found);
                state.needs_web_search = false;
                Ok(Outcome::Searched)
            }
            Node::Generate => {
                let answer = self
                    .generator
                    .generate(&state.question, &state.documents)
                    .await?;
                state.generation = Some(answer);
                Ok(Outcome::Generated)
            }
            Node::CheckGroundedness => {
                let label = self
                    .groundedness
                    .classify(&state.documents, state.answer())
                    .await?;
                Ok(Outcome::Checked(label))
            }
            Node::CheckUtility => {
                let label = self.utility.classify(&state.question, state.answer()).await?;
                Ok(Outcome::Assessed(label))
            }
            Node::Terminate => unreachable!("terminate is handled by the run loop"),
        }
    }

    /// Keep only relevant passages. Returns whether web search is needed:
    /// any passage was dropped, or nothing was retrieved at all.
    async fn grade_documents(&self, state: &mut RunState) -> Result<bool> {
        let question = state.question.as_str();
        let grades: Vec<Relevance> = if self.config.concurrent_grading {
            join_all(
                state
                    .documents
                    .iter()
                    .map(|p| self.relevance.classify(question, p)),
            )
            .await
            .into_iter()
            .collect::<Result<_>>()?
        } else {
            let mut grades = Vec::with_capacity(state.documents.len());
            for passage in &state.documents {
                grades.push(self.relevance.classify(question, passage).await?);
            }
            grades
        };

        let total = state.documents.len();
        let mut kept = Vec::with_capacity(total);
        for (passage, grade) in std::mem::take(&mut state.documents).into_iter().zip(grades) {
            let relevant = grade == Relevance::Relevant;
            self.events.publish(WorkflowEvent::DocumentGraded {
                run_id: state.run_id.clone(),
                source: passage.source.clone(),
                relevant,
            });
            if relevant {
                kept.push(passage);
            }
        }

        let needs_web_search = total == 0 || kept.len() < total;
        info!(
            run_id = %state.run_id,
            relevant = kept.len(),
            total,
            needs_web_search,
            "Graded documents"
        );
        state.documents = kept;
        state.needs_web_search = needs_web_search;
        Ok(needs_web_search)
    }
}

//! Scripted scenarios for the `simulate` subcommand
//!
//! A scenario is a TOML file describing a question, the planner's proposal
//! and how each step's capability behaves:
//!
//! ```toml
//! question = "How does our LTIR compare with peers?"
//! kind = "plan"
//! analysis = "Our figure against two peers"
//! answers = [["Companies A and B"]]
//!
//! [[steps]]
//! step_type = "KB_QUERY"
//! action = "Our LTIR"
//! output = "LTIR 0.31"
//!
//! [[steps]]
//! step_type = "WEB_SEARCH"
//! action = "Peer LTIR"
//! clarify = ["Which peers?"]
//!
//! [[steps]]
//! step_type = "COMPARE"
//! action = "Compare LTIR"
//! description = "Rank the three rates"
//! dependencies = [1, 2]
//! ```

use async_trait::async_trait;
use delve_core::{
    Capability, CapabilityOutcome, CapabilityRegistry, Classifier, Collaborators,
    ConversationContext, FinalAnswer, Orchestrator, OrchestratorConfig, Outcome, Planner,
    RequestKind, SharedContext, StageError, StageGenerator, StageJob, StepInput, TopicSpec,
};
use delve_plan::{CapabilityKind, PlanProposal, ProposedStep};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted step
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScenarioStep {
    step_type: String,
    action: String,
    /// Defaults to the action
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<u32>,
    /// Reply text; defaults to an echo of the action
    output: Option<String>,
    /// Fail with this message instead of replying
    fail: Option<String>,
    /// Ask these questions before replying
    #[serde(default)]
    clarify: Vec<String>,
    /// How many calls ask before the step replies
    #[serde(default = "one")]
    clarify_times: usize,
    #[serde(default)]
    delay_ms: u64,
}

fn one() -> usize {
    1
}

/// Prior turn fed into the conversation
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScenarioTurn {
    question: String,
    answer: String,
}

/// A complete scripted request
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Scenario {
    question: String,
    #[serde(default = "plan_kind")]
    kind: RequestKind,
    complexity: Option<String>,
    analysis: Option<String>,
    #[serde(default)]
    history: Vec<ScenarioTurn>,
    #[serde(default)]
    steps: Vec<ScenarioStep>,
    /// Answers for successive clarification rounds
    #[serde(default)]
    answers: Vec<Vec<String>>,
}

fn plan_kind() -> RequestKind {
    RequestKind::Plan
}

/// What a simulated run ended with
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub(crate) enum SimulationReport {
    /// Request answered
    Answer {
        rounds: u32,
        answer: FinalAnswer,
    },
    /// Scripted answers ran out while questions were pending
    Unanswered {
        rounds: u32,
        questions: Vec<String>,
    },
}

impl Scenario {
    pub(crate) fn from_file(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&source)?)
    }

    fn proposal(&self) -> PlanProposal {
        let steps = self
            .steps
            .iter()
            .map(|step| {
                let proposed = ProposedStep::new(step.step_type.clone(), step.action.clone());
                let proposed = match &step.description {
                    Some(description) => proposed.with_description(description.clone()),
                    None => proposed,
                };
                step.dependencies
                    .iter()
                    .fold(proposed, |proposed, dep| proposed.depends_on(*dep))
            })
            .collect();
        let mut proposal = PlanProposal::new(steps);
        if let Some(complexity) = &self.complexity {
            proposal = proposal.with_complexity(complexity.clone());
        }
        if let Some(analysis) = &self.analysis {
            proposal = proposal.with_analysis(analysis.clone());
        }
        proposal
    }

    fn conversation(&self) -> ConversationContext {
        self.history
            .iter()
            .fold(ConversationContext::new(), |conversation, turn| {
                conversation.with_turn(turn.question.clone(), turn.answer.clone())
            })
    }

    /// Run the scenario to completion or until scripted answers run out
    pub(crate) async fn run(self, config: OrchestratorConfig) -> anyhow::Result<SimulationReport> {
        let planner_reply = serde_json::to_string(&self.proposal())?;
        let capability = Arc::new(SimulatedCapability::new(self.steps.clone()));
        let collaborators = Collaborators::new(
            Arc::new(FixedKind(self.kind)),
            Arc::new(CannedPlanner(planner_reply)),
            CapabilityRegistry::new()
                .with(CapabilityKind::WebSearch, capability.clone())
                .with(CapabilityKind::Knowledge, capability.clone())
                .with(CapabilityKind::Synthesis, capability),
            Arc::new(EchoStages),
        );
        let orchestrator = Orchestrator::new(config, collaborators)?;

        let conversation = self.conversation();
        let mut outcome = orchestrator.execute_plan(&self.question, &conversation).await?;
        let mut answers = self.answers.into_iter();
        let mut rounds = 0;
        loop {
            match outcome {
                Outcome::Answer(answer) => return Ok(SimulationReport::Answer { rounds, answer }),
                Outcome::Clarification(request) => {
                    rounds = request.round;
                    tracing::info!(
                        round = request.round,
                        questions = ?request.questions,
                        "clarification requested"
                    );
                    let Some(reply) = answers.next() else {
                        return Ok(SimulationReport::Unanswered {
                            rounds,
                            questions: request.questions,
                        });
                    };
                    outcome = orchestrator.resume_with_answers(request.state, reply).await?;
                }
            }
        }
    }
}

struct FixedKind(RequestKind);

#[async_trait]
impl Classifier for FixedKind {
    async fn classify(&self, _question: &str, _conversation: &ConversationContext) -> RequestKind {
        self.0
    }
}

struct CannedPlanner(String);

#[async_trait]
impl Planner for CannedPlanner {
    async fn plan(&self, _question: &str, _shared: &SharedContext) -> CapabilityOutcome {
        CapabilityOutcome::Output(self.0.clone())
    }
}

struct EchoStages;

#[async_trait]
impl StageGenerator for EchoStages {
    async fn generate(&self, job: &StageJob, topic: &TopicSpec) -> Result<String, StageError> {
        Ok(format!("<h2>{}</h2><p>{}</p>", job.stage_index.title(), topic.topic))
    }
}

struct SimulatedCapability {
    steps: Vec<ScenarioStep>,
    calls: Vec<AtomicUsize>,
}

impl SimulatedCapability {
    fn new(steps: Vec<ScenarioStep>) -> Self {
        let calls = steps.iter().map(|_| AtomicUsize::new(0)).collect();
        Self { steps, calls }
    }
}

#[async_trait]
impl Capability for SimulatedCapability {
    async fn invoke(&self, input: &StepInput, shared: &SharedContext) -> CapabilityOutcome {
        let idx = usize::try_from(input.step.id.0).map_or(usize::MAX, |id| id.wrapping_sub(1));
        let (Some(step), Some(calls)) = (self.steps.get(idx), self.calls.get(idx)) else {
            // Fallback plans carry steps the scenario never declared.
            return CapabilityOutcome::Output(format!("simulated: {}", input.step.action));
        };
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(step_id = %input.step.id, call, prompt = %input.render(shared), "simulated call");

        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
        if let Some(message) = &step.fail {
            return CapabilityOutcome::Failed(message.clone());
        }
        if !step.clarify.is_empty() && call <= step.clarify_times {
            return CapabilityOutcome::Clarification(step.clarify.clone());
        }
        CapabilityOutcome::Output(
            step.output
                .clone()
                .unwrap_or_else(|| format!("simulated: {}", input.step.action)),
        )
    }
}

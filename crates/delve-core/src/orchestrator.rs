//! Request orchestration
//!
//! The two public entry points of the execution core:
//! - [`Orchestrator::execute_plan`] classifies a question, builds a plan and
//!   runs it, or generates a staged report
//! - [`Orchestrator::resume_with_answers`] continues a request paused for
//!   clarification from its serialized [`SuspendedState`]
//!
//! Either returns a [`FinalAnswer`] or another [`ClarificationRequest`].
//! Only an invalid plan is an error; everything else degrades into a
//! caveated answer.

use crate::answer::{Caveat, FinalAnswer};
use crate::capability::{
    CapabilityOutcome, CapabilityRegistry, Classifier, Planner, RequestKind, SharedContext,
    StageGenerator,
};
use crate::clarification::{self, ClarificationController, ClarificationState, Decision, QaPair};
use crate::config::OrchestratorConfig;
use crate::context::{ConversationContext, ExecutionContext, StepStatus};
use crate::error::OrchestratorError;
use crate::scheduler::{DependencyScheduler, ScheduleOutcome};
use crate::stages::{StageSplitter, TopicSpec};
use delve_plan::{
    ComplexityHeuristic, Plan, PlanBuilder, PlanProposal, StepId, StepRouter, TierCaps,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// External collaborators of the core
#[derive(Clone)]
pub struct Collaborators {
    /// Request classifier
    pub classifier: Arc<dyn Classifier>,
    /// Planning capability
    pub planner: Arc<dyn Planner>,
    /// Step capabilities
    pub capabilities: CapabilityRegistry,
    /// Report stage writer
    pub stage_generator: Arc<dyn StageGenerator>,
    /// Step type routing table
    pub router: StepRouter,
}

impl Collaborators {
    /// Collaborators with the standard routing table
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        planner: Arc<dyn Planner>,
        capabilities: CapabilityRegistry,
        stage_generator: Arc<dyn StageGenerator>,
    ) -> Self {
        Self {
            classifier,
            planner,
            capabilities,
            stage_generator,
            router: StepRouter::new(),
        }
    }

    /// With a routing table
    #[inline]
    #[must_use]
    pub fn with_router(mut self, router: StepRouter) -> Self {
        self.router = router;
        self
    }
}

/// Everything needed to continue a paused request
///
/// Serializable; the only carrier of a paused execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedState {
    /// Question as first asked
    pub question: String,
    /// Prior turns
    pub conversation: ConversationContext,
    /// Request class
    pub kind: RequestKind,
    /// Plan being executed; `None` while the planner itself awaits input
    pub plan: Option<Plan>,
    /// Step records so far
    pub context: Option<ExecutionContext>,
    /// Dialogue state
    pub clarification: ClarificationState,
    /// Answers from earlier rounds, in order
    pub answers: Vec<QaPair>,
}

impl SuspendedState {
    fn fresh(question: &str, conversation: &ConversationContext, kind: RequestKind) -> Self {
        Self {
            question: question.to_string(),
            conversation: conversation.clone(),
            kind,
            plan: None,
            context: None,
            clarification: ClarificationState::new(),
            answers: Vec::new(),
        }
    }

    /// Encode as JSON
    ///
    /// # Errors
    /// Serialization failure
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode from JSON; the plan is re-validated
    ///
    /// # Errors
    /// Malformed JSON or a structurally invalid plan
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reject states the scheduler could not continue faithfully
    fn check(&self, caps: &TierCaps) -> Result<(), OrchestratorError> {
        let reject = |msg: String| Err(OrchestratorError::Resume(msg));
        if self.kind == RequestKind::Report {
            return reject("report requests are never suspended".to_string());
        }
        let (plan, context) = match (&self.plan, &self.context) {
            (None, Some(_)) => return reject("execution records without a plan".to_string()),
            (Some(plan), Some(context)) => (plan, context),
            _ => return Ok(()),
        };

        let cap = caps.cap(plan.tier());
        if plan.len() > cap {
            return reject(format!(
                "{} steps exceed the {} tier cap of {cap}",
                plan.len(),
                plan.tier()
            ));
        }
        let matches = context.len() == plan.len()
            && plan.steps().iter().all(|s| context.get(s.id).is_some());
        if !matches {
            return reject("execution records do not match the plan".to_string());
        }
        // Running steps are never redispatched; done steps must carry output.
        for (id, record) in context.records() {
            let lost = match record.status {
                StepStatus::Running => true,
                StepStatus::Done => record.output.trim().is_empty(),
                _ => false,
            };
            if lost {
                return reject(format!(
                    "step {id} is {} without a usable result",
                    record.status.as_str()
                ));
            }
        }
        Ok(())
    }
}

/// Questions surfaced to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    /// Ordered questions
    pub questions: Vec<String>,
    /// Round number, starting at 1
    pub round: u32,
    /// Rounds before lenient defaults
    pub max_rounds: u32,
    /// Paused step, if a step (not the planner) asked
    pub step_id: Option<StepId>,
    /// State to pass back to [`Orchestrator::resume_with_answers`]
    pub state: SuspendedState,
}

/// Result of an entry point
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Request answered
    Answer(FinalAnswer),
    /// Caller input needed
    Clarification(ClarificationRequest),
}

impl Outcome {
    /// The answer, if any
    #[must_use]
    pub fn answer(&self) -> Option<&FinalAnswer> {
        match self {
            Outcome::Answer(answer) => Some(answer),
            Outcome::Clarification(_) => None,
        }
    }

    /// The clarification request, if any
    #[must_use]
    pub fn clarification(&self) -> Option<&ClarificationRequest> {
        match self {
            Outcome::Clarification(request) => Some(request),
            Outcome::Answer(_) => None,
        }
    }
}

enum Planned {
    Ready(Plan),
    Clarify(Vec<String>),
}

/// Plan execution core
pub struct Orchestrator {
    config: OrchestratorConfig,
    builder: PlanBuilder,
    scheduler: DependencyScheduler,
    controller: ClarificationController,
    splitter: StageSplitter,
    classifier: Arc<dyn Classifier>,
    planner: Arc<dyn Planner>,
}

impl Orchestrator {
    /// Create an orchestrator
    ///
    /// # Errors
    /// `OrchestratorError::Config` if the configuration is invalid
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let Collaborators {
            classifier,
            planner,
            capabilities,
            stage_generator,
            router,
        } = collaborators;

        Ok(Self {
            builder: PlanBuilder::new().with_caps(config.plan.caps),
            scheduler: DependencyScheduler::new(router, capabilities, &config),
            controller: ClarificationController::new(&config.clarification),
            splitter: StageSplitter::new(stage_generator, config.stages),
            classifier,
            planner,
            config,
        })
    }

    /// With a complexity heuristic
    #[inline]
    #[must_use]
    pub fn with_heuristic(mut self, heuristic: Arc<dyn ComplexityHeuristic>) -> Self {
        self.builder = self.builder.with_heuristic(heuristic);
        self
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Answer a question
    ///
    /// # Errors
    /// `OrchestratorError::PlanInvalid` if the planner proposed an invalid
    /// plan; the caller should re-plan or ask a single capability
    pub async fn execute_plan(
        &self,
        question: &str,
        conversation: &ConversationContext,
    ) -> Result<Outcome, OrchestratorError> {
        let kind = self.classifier.classify(question, conversation).await;
        tracing::info!(%kind, prior_turns = conversation.turns().len(), "request classified");

        if kind == RequestKind::Report {
            return Ok(Outcome::Answer(self.report(conversation).await));
        }
        self.drive(SuspendedState::fresh(question, conversation, kind))
            .await
    }

    /// Continue a paused request with the caller's answers
    ///
    /// # Errors
    /// `OrchestratorError::Resume` if the state is not awaiting answers or
    /// is inconsistent; `OrchestratorError::PlanInvalid` as for
    /// [`execute_plan`](Self::execute_plan)
    pub async fn resume_with_answers(
        &self,
        mut state: SuspendedState,
        answers: Vec<String>,
    ) -> Result<Outcome, OrchestratorError> {
        state.check(&self.config.plan.caps)?;
        let pairs = self.controller.accept_answers(&mut state.clarification, answers)?;
        tracing::info!(
            round = state.clarification.round,
            answers = pairs.len(),
            "resuming with clarification answers"
        );
        state.answers.extend(pairs);
        self.drive(state).await
    }

    async fn drive(&self, mut state: SuspendedState) -> Result<Outcome, OrchestratorError> {
        let window = self.config.context.window_turns;
        loop {
            let assumptions = if state.clarification.is_aborted() {
                self.controller.lenient_assumptions(&state.question)
            } else {
                Vec::new()
            };
            let effective = clarification::merge(&state.question, &state.answers, &assumptions);
            let rendered = state.conversation.render(window);

            let mut shared = SharedContext::new(effective.clone()).with_conversation(rendered.clone());
            if let Some(notes) = clarification::context_notes(&state.answers, &assumptions) {
                shared = shared.with_notes(notes);
            }
            if state.clarification.is_aborted() {
                shared = shared.without_clarification();
            }

            let plan = match state.plan.take() {
                Some(plan) => plan,
                None => match self.make_plan(&state, &effective, &rendered, &shared).await? {
                    Planned::Ready(plan) => plan,
                    Planned::Clarify(questions) => {
                        match self.controller.on_signal(&mut state.clarification, None, questions) {
                            Decision::Ask => return Ok(self.ask(state)),
                            Decision::Abort => continue,
                        }
                    }
                },
            };

            let context = state
                .context
                .take()
                .unwrap_or_else(|| ExecutionContext::new(&plan));
            match self.scheduler.execute(&plan, context, Arc::new(shared)).await {
                ScheduleOutcome::Completed {
                    context,
                    early_terminated,
                } => {
                    self.controller.resolve(&mut state.clarification);
                    let mut answer = FinalAnswer::from_execution(state.kind, &context, early_terminated);
                    if !assumptions.is_empty() {
                        answer = answer.with_caveat(Caveat::LenientDefaultsApplied { assumptions });
                    }
                    tracing::info!(
                        plan_id = %plan.id(),
                        success_rate = answer.success_rate,
                        caveats = answer.caveats.len(),
                        "request answered"
                    );
                    return Ok(Outcome::Answer(answer));
                }
                ScheduleOutcome::Suspended {
                    context,
                    step_id,
                    questions,
                } => {
                    let decision =
                        self.controller
                            .on_signal(&mut state.clarification, Some(step_id), questions);
                    state.plan = Some(plan);
                    state.context = Some(context);
                    if decision == Decision::Ask {
                        return Ok(self.ask(state));
                    }
                }
            }
        }
    }

    async fn make_plan(
        &self,
        state: &SuspendedState,
        effective: &str,
        rendered: &str,
        shared: &SharedContext,
    ) -> Result<Planned, OrchestratorError> {
        let prior = Some(rendered).filter(|r| !r.trim().is_empty());

        if let Some(step_type) = state.kind.single_step_type() {
            // Answers reach single-step plans through the step notes.
            return Ok(Planned::Ready(
                self.builder.single_step(&state.question, prior, step_type)?,
            ));
        }
        if state.kind == RequestKind::Report {
            return Err(OrchestratorError::Resume(
                "report requests do not execute plans".to_string(),
            ));
        }

        let proposal = match self.planner.plan(effective, shared).await {
            CapabilityOutcome::Output(text) => match PlanProposal::from_planner_text(&text) {
                Ok(proposal) => Some(proposal),
                Err(err) => {
                    tracing::warn!(error = %err, "planner reply unparseable, using fallback plan");
                    None
                }
            },
            CapabilityOutcome::Failed(message) => {
                tracing::warn!(error = %message, "planner failed, using fallback plan");
                None
            }
            CapabilityOutcome::Clarification(questions) if shared.allow_clarification => {
                return Ok(Planned::Clarify(questions));
            }
            CapabilityOutcome::Clarification(_) => {
                tracing::warn!("planner still needs clarification, using fallback plan");
                None
            }
        };

        let plan = self.builder.build(effective, prior, proposal).map_err(|err| {
            tracing::warn!(error = %err, reason = err.tag(), "planner proposed an invalid plan");
            err
        })?;
        Ok(Planned::Ready(plan))
    }

    fn ask(&self, state: SuspendedState) -> Outcome {
        Outcome::Clarification(ClarificationRequest {
            questions: state.clarification.questions.clone(),
            round: state.clarification.round,
            max_rounds: self.controller.max_rounds(),
            step_id: state.clarification.pending_step_id,
            state,
        })
    }

    async fn report(&self, conversation: &ConversationContext) -> FinalAnswer {
        let Some(source_material) = conversation
            .last_answer()
            .filter(|answer| !answer.trim().is_empty())
        else {
            tracing::info!("report requested without a previous answer");
            return FinalAnswer::no_source_material();
        };
        let topic = TopicSpec {
            topic: conversation
                .turns()
                .last()
                .map(|turn| turn.question.clone())
                .unwrap_or_default(),
            source_material: source_material.to_string(),
        };
        FinalAnswer::from_report(self.splitter.generate(&topic).await)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

//! Testing utilities for the Delve workspace
//!
//! Scripted stand-ins for every external collaborator, plus plan fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use delve_core::{
    Capability, CapabilityOutcome, CapabilityRegistry, Classifier, Collaborators,
    ConversationContext, Planner, RequestKind, SharedContext, StageError, StageGenerator,
    StageIndex, StageJob, StepInput, TopicSpec,
};
use delve_plan::{CapabilityKind, Plan, PlanBuilder, PlanProposal, ProposedStep, StepId, StepType};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted reply for one step
#[derive(Debug, Clone)]
pub enum StepScript {
    Output(String),
    Fail(String),
    /// Ask the questions on the first `times` calls, then answer
    Clarify {
        questions: Vec<String>,
        times: usize,
        then: String,
    },
}

/// One recorded capability call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub step_id: StepId,
    pub step_type: StepType,
    pub prompt: String,
    pub allow_clarification: bool,
}

/// Capability with per-step scripted replies and delays
///
/// Unscripted steps answer `"{STEP_TYPE}: {action}"`.
#[derive(Debug, Default)]
pub struct ScriptedCapability {
    scripts: Mutex<HashMap<StepId, StepScript>>,
    delays: Mutex<HashMap<StepId, Duration>>,
    calls: Mutex<HashMap<StepId, usize>>,
    log: Mutex<Vec<Invocation>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, id: u32, output: impl Into<String>) -> Self {
        self.scripts
            .lock()
            .insert(StepId(id), StepScript::Output(output.into()));
        self
    }

    pub fn with_failure(self, id: u32, message: impl Into<String>) -> Self {
        self.scripts
            .lock()
            .insert(StepId(id), StepScript::Fail(message.into()));
        self
    }

    /// Ask on every call
    pub fn with_clarification(self, id: u32, questions: &[&str]) -> Self {
        self.with_clarification_times(id, questions, usize::MAX, "")
    }

    /// Ask on the first `times` calls, then answer `then`
    pub fn with_clarification_times(
        self,
        id: u32,
        questions: &[&str],
        times: usize,
        then: impl Into<String>,
    ) -> Self {
        self.scripts.lock().insert(
            StepId(id),
            StepScript::Clarify {
                questions: questions.iter().map(|q| q.to_string()).collect(),
                times,
                then: then.into(),
            },
        );
        self
    }

    pub fn with_delay(self, id: u32, delay: Duration) -> Self {
        self.delays.lock().insert(StepId(id), delay);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().clone()
    }

    pub fn invocation_count(&self, id: u32) -> usize {
        self.calls.lock().get(&StepId(id)).copied().unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn registry(self: &Arc<Self>) -> CapabilityRegistry {
        CapabilityRegistry::new()
            .with(CapabilityKind::WebSearch, self.clone())
            .with(CapabilityKind::Knowledge, self.clone())
            .with(CapabilityKind::Synthesis, self.clone())
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn invoke(&self, input: &StepInput, shared: &SharedContext) -> CapabilityOutcome {
        let id = input.step.id;
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        self.log.lock().push(Invocation {
            step_id: id,
            step_type: input.step.step_type,
            prompt: input.render(shared),
            allow_clarification: shared.allow_clarification,
        });

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = self.delays.lock().get(&id).copied();
        tokio::time::sleep(delay.unwrap_or(Duration::from_millis(5))).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let script = self.scripts.lock().get(&id).cloned();
        match script {
            Some(StepScript::Output(text)) => CapabilityOutcome::Output(text),
            Some(StepScript::Fail(message)) => CapabilityOutcome::Failed(message),
            Some(StepScript::Clarify {
                questions,
                times,
                then,
            }) => {
                if call <= times {
                    CapabilityOutcome::Clarification(questions)
                } else {
                    CapabilityOutcome::Output(then)
                }
            }
            None => CapabilityOutcome::Output(format!(
                "{}: {}",
                input.step.step_type, input.step.action
            )),
        }
    }
}

/// Classifier that always returns one tag
#[derive(Debug, Clone, Copy)]
pub struct FixedClassifier(pub RequestKind);

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _question: &str, _conversation: &ConversationContext) -> RequestKind {
        self.0
    }
}

/// Planner replying from a queue of texts; the last reply repeats
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<String>>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPlanner {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            questions: Mutex::new(Vec::new()),
        }
    }

    /// Planner replying with the JSON of a proposal
    pub fn proposing(proposal: &PlanProposal) -> Self {
        let json = serde_json::to_string_pretty(proposal).expect("proposal serializes");
        Self::new(&[format!("```json\n{json}\n```").as_str()])
    }

    /// Questions the planner was asked, in order
    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, question: &str, _shared: &SharedContext) -> CapabilityOutcome {
        self.questions.lock().push(question.to_string());
        let mut replies = self.replies.lock();
        let reply = if replies.len() > 1 {
            replies.pop_front().unwrap_or_default()
        } else {
            replies.front().cloned().unwrap_or_default()
        };
        CapabilityOutcome::from_text(reply)
    }
}

/// Stage generator with per-attempt scripted replies
///
/// With no script left, answers `<p>{title}</p>` for the stage.
#[derive(Debug, Default)]
pub struct ScriptedStageGenerator {
    replies: Mutex<VecDeque<Result<String, StageError>>>,
    delay: Option<Duration>,
    jobs: Mutex<Vec<StageJob>>,
}

impl ScriptedStageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_ok(self, text: impl Into<String>) -> Self {
        self.replies.lock().push_back(Ok(text.into()));
        self
    }

    pub fn then_err(self, message: impl Into<String>) -> Self {
        self.replies
            .lock()
            .push_back(Err(StageError::Generation(message.into())));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn jobs(&self) -> Vec<StageJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl StageGenerator for ScriptedStageGenerator {
    async fn generate(&self, job: &StageJob, _topic: &TopicSpec) -> Result<String, StageError> {
        self.jobs.lock().push(job.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.replies.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(default_stage(job.stage_index)))
    }
}

fn default_stage(index: StageIndex) -> String {
    format!("<p>{}</p>", index.title())
}

/// Proposal from `(step_type, dependencies)` pairs; actions are `"step N"`
pub fn proposal(steps: &[(&str, &[u32])]) -> PlanProposal {
    PlanProposal::new(
        steps
            .iter()
            .enumerate()
            .map(|(idx, (step_type, deps))| {
                deps.iter().fold(
                    ProposedStep::new(*step_type, format!("step {}", idx + 1)),
                    |step, dep| step.depends_on(*dep),
                )
            })
            .collect(),
    )
    .with_complexity("complex")
}

/// Validated plan from `(step_type, dependencies)` pairs
pub fn plan(steps: &[(&str, &[u32])]) -> Plan {
    PlanBuilder::new()
        .build("test question", None, Some(proposal(steps)))
        .expect("fixture plan is valid")
}

/// Collaborators wiring the scripted stand-ins together
pub fn collaborators(
    kind: RequestKind,
    planner: Arc<ScriptedPlanner>,
    capability: Arc<ScriptedCapability>,
    stages: Arc<ScriptedStageGenerator>,
) -> Collaborators {
    Collaborators::new(
        Arc::new(FixedClassifier(kind)),
        planner,
        capability.registry(),
        stages,
    )
}

//! Capability contracts
//!
//! The narrow interface between the execution core and its external
//! collaborators:
//! - [`Capability`] answers one routed step
//! - [`Classifier`] tags an incoming request
//! - [`Planner`] proposes a step graph
//! - [`StageGenerator`] writes one stage of a long-form report
//!
//! Capabilities that speak plain text signal "cannot proceed without more
//! input" with the [`CLARIFICATION_MARKER`] sentinel, parsed by
//! [`CapabilityOutcome::from_text`].

use crate::context::ConversationContext;
use crate::error::StageError;
use crate::stages::{StageJob, TopicSpec};
use async_trait::async_trait;
use delve_plan::{CapabilityKind, PlanId, Step, StepId, StepType};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

/// Leading marker of a plain-text clarification reply
pub const CLARIFICATION_MARKER: &str = "CLARIFICATION_NEEDED:";

// A marker only counts when whitespace follows, so "3.5%" or "-2%" survive.
static QUESTION_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\d+[.)]|[-*\u{2022}])(?:\s+|$)").expect("static pattern"));

/// Request class assigned by the external classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Answer from free reasoning
    Direct,
    /// Answer from the knowledge base
    Knowledge,
    /// Answer from web search
    Research,
    /// Multi-step plan
    Plan,
    /// Long-form report over the previous answer
    Report,
}

impl RequestKind {
    /// Step type of the one-step plan for single-capability kinds
    #[must_use]
    pub fn single_step_type(&self) -> Option<StepType> {
        match self {
            RequestKind::Direct => Some(StepType::Reasoning),
            RequestKind::Knowledge => Some(StepType::KbQuery),
            RequestKind::Research => Some(StepType::WebSearch),
            RequestKind::Plan | RequestKind::Report => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Direct => "direct",
            RequestKind::Knowledge => "knowledge",
            RequestKind::Research => "research",
            RequestKind::Plan => "plan",
            RequestKind::Report => "report",
        };
        f.write_str(name)
    }
}

/// Output of a completed dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyOutput {
    /// Producing step
    pub step_id: StepId,
    /// Producing step's type
    pub step_type: StepType,
    /// Output text
    pub output: String,
}

/// Everything a capability receives for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInput {
    /// Plan the step belongs to
    pub plan_id: PlanId,
    /// The step itself
    pub step: Step,
    /// Outputs of direct dependencies, ascending by step id
    pub dependency_outputs: Vec<DependencyOutput>,
}

impl StepInput {
    /// Render the step as a capability prompt
    ///
    /// Dependency outputs appear in ascending step id order regardless of
    /// the order they completed in.
    #[must_use]
    pub fn render(&self, shared: &SharedContext) -> String {
        let action = &self.step.action;
        let mut out = match self.step.step_type {
            StepType::Aggregate => {
                let mut text = String::from("Aggregate the following data:\n\n");
                for dep in &self.dependency_outputs {
                    let _ = write!(text, "Step {} output:\n{}\n\n", dep.step_id, dep.output);
                }
                text
            }
            StepType::Compare => {
                let mut text = format!("Compare the following data:\n\nComparison task: {action}\n\n");
                for dep in &self.dependency_outputs {
                    let _ = write!(text, "Data from step {}:\n{}\n\n", dep.step_id, dep.output);
                }
                text
            }
            StepType::NewsSearch => format!("Search recent news about: {action}"),
            StepType::Reasoning => format!("Please reason about: {action}"),
            StepType::WebSearch | StepType::KbQuery => {
                let mut text = action.clone();
                if !self.dependency_outputs.is_empty() {
                    text.push_str("\n\nContext from earlier steps:\n");
                    for dep in &self.dependency_outputs {
                        let _ = write!(text, "\nStep {} output:\n{}\n", dep.step_id, dep.output);
                    }
                }
                text
            }
        };
        if let Some(notes) = shared.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            if !out.ends_with('\n') {
                out.push_str("\n\n");
            }
            out.push_str(notes.trim_end());
            out.push('\n');
        }
        out
    }
}

/// Request-wide context shared by every step of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedContext {
    /// Effective question, including merged clarification answers
    pub question: String,
    /// Rendered prior turns
    pub conversation: String,
    /// Clarification answers and assumptions, appended to step prompts
    pub notes: Option<String>,
    /// Whether a clarification reply pauses the step
    pub allow_clarification: bool,
}

impl SharedContext {
    /// Context for a fresh request
    #[must_use]
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            conversation: String::new(),
            notes: None,
            allow_clarification: true,
        }
    }

    /// With rendered conversation
    #[inline]
    #[must_use]
    pub fn with_conversation(mut self, conversation: impl Into<String>) -> Self {
        self.conversation = conversation.into();
        self
    }

    /// With step prompt notes
    #[inline]
    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Refuse further clarification
    #[inline]
    #[must_use]
    pub fn without_clarification(mut self) -> Self {
        self.allow_clarification = false;
        self
    }
}

/// Result of one capability call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityOutcome {
    /// Normal answer
    Output(String),
    /// Capability-reported failure
    Failed(String),
    /// Cannot proceed without these questions answered
    Clarification(Vec<String>),
}

impl CapabilityOutcome {
    /// Interpret a plain-text reply, recognizing the clarification sentinel
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        match parse_clarification(&text) {
            Some(questions) => Self::Clarification(questions),
            None => Self::Output(text),
        }
    }

    /// Whether this is a clarification signal
    #[inline]
    #[must_use]
    pub fn is_clarification(&self) -> bool {
        matches!(self, Self::Clarification(_))
    }
}

/// Parse a clarification sentinel into its ordered questions
///
/// Returns `None` when the text does not begin with the marker. Accepts
/// `1.` and `1)` numbering, bullets and bare lines; blank lines are ignored.
/// Text after the marker on the first line counts as a question.
#[must_use]
pub fn parse_clarification(text: &str) -> Option<Vec<String>> {
    let rest = text.trim_start().strip_prefix(CLARIFICATION_MARKER)?;
    let questions = rest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| QUESTION_PREFIX.replace(line, "").trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    Some(questions)
}

/// A specialist answering routed steps
#[async_trait]
pub trait Capability: Send + Sync {
    /// Answer one step
    async fn invoke(&self, input: &StepInput, shared: &SharedContext) -> CapabilityOutcome;
}

/// External request classifier
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Tag a question given the conversation so far
    async fn classify(&self, question: &str, conversation: &ConversationContext) -> RequestKind;
}

/// External planning capability
///
/// An `Output` is parsed as a plan proposal; a reply that does not parse
/// falls back to a single web search.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Propose a plan for the question
    async fn plan(&self, question: &str, shared: &SharedContext) -> CapabilityOutcome;
}

/// External long-form stage writer
#[async_trait]
pub trait StageGenerator: Send + Sync {
    /// Write one stage
    async fn generate(&self, job: &StageJob, topic: &TopicSpec) -> Result<String, StageError>;
}

/// Capability implementations by class
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<CapabilityKind, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a capability (replaces any existing one for the kind)
    #[inline]
    #[must_use]
    pub fn with(mut self, kind: CapabilityKind, capability: Arc<dyn Capability>) -> Self {
        self.register(kind, capability);
        self
    }

    /// Register a capability
    pub fn register(&mut self, kind: CapabilityKind, capability: Arc<dyn Capability>) {
        self.capabilities.insert(kind, capability);
    }

    /// Look up a capability
    #[must_use]
    pub fn get(&self, kind: CapabilityKind) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(&kind).cloned()
    }

    /// Registered kinds
    pub fn kinds(&self) -> impl Iterator<Item = CapabilityKind> + '_ {
        self.capabilities.keys().copied()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds().collect();
        kinds.sort();
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

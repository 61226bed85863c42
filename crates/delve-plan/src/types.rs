//! Core plan types
//!
//! Defines the fundamental types of the plan model:
//! - Step identifiers and step types
//! - Complexity tiers and their caps
//! - Validated plans

use crate::error::UnknownStepType;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Step identifier, unique and strictly increasing in submission order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub u32);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique plan identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Ulid);

impl PlanId {
    /// Generate new plan ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Analyze concepts, define terms, identify entities
    Reasoning,
    /// General web search
    WebSearch,
    /// Recent news search
    NewsSearch,
    /// Knowledge base retrieval
    KbQuery,
    /// Collect and organize prior outputs
    Aggregate,
    /// Compare prior outputs
    Compare,
}

impl StepType {
    /// Every step type, in declaration order
    pub const ALL: [StepType; 6] = [
        StepType::Reasoning,
        StepType::WebSearch,
        StepType::NewsSearch,
        StepType::KbQuery,
        StepType::Aggregate,
        StepType::Compare,
    ];

    /// Canonical upper-case name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Reasoning => "REASONING",
            StepType::WebSearch => "WEB_SEARCH",
            StepType::NewsSearch => "NEWS_SEARCH",
            StepType::KbQuery => "KB_QUERY",
            StepType::Aggregate => "AGGREGATE",
            StepType::Compare => "COMPARE",
        }
    }

    /// Whether the step combines outputs of earlier steps
    #[inline]
    #[must_use]
    pub fn is_synthesis(&self) -> bool {
        matches!(self, StepType::Aggregate | StepType::Compare)
    }

    /// Whether the step only collects data
    #[inline]
    #[must_use]
    pub fn is_data_gathering(&self) -> bool {
        matches!(
            self,
            StepType::WebSearch | StepType::NewsSearch | StepType::KbQuery
        )
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = UnknownStepType;

    /// Case-insensitive; accepts `web_search`, `WEB_SEARCH` and `web-search`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        StepType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownStepType(s.to_string()))
    }
}

/// Complexity tier assigned to a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    /// Few entities, no comparison
    Simple,
    /// Several entities or one comparison
    Medium,
    /// Many entities or chained comparisons
    Complex,
}

impl ComplexityTier {
    /// Lower-case name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityTier::Simple => "simple",
            ComplexityTier::Medium => "medium",
            ComplexityTier::Complex => "complex",
        }
    }
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplexityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(ComplexityTier::Simple),
            "medium" => Ok(ComplexityTier::Medium),
            "complex" => Ok(ComplexityTier::Complex),
            other => Err(format!("unknown complexity tier: {other}")),
        }
    }
}

/// Maximum step count per complexity tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCaps {
    /// Cap for simple plans
    pub simple: usize,
    /// Cap for medium plans
    pub medium: usize,
    /// Cap for complex plans
    pub complex: usize,
}

impl TierCaps {
    /// Cap for a tier
    #[inline]
    #[must_use]
    pub fn cap(&self, tier: ComplexityTier) -> usize {
        match tier {
            ComplexityTier::Simple => self.simple,
            ComplexityTier::Medium => self.medium,
            ComplexityTier::Complex => self.complex,
        }
    }

    /// Caps must be non-zero and non-decreasing with tier
    #[must_use]
    pub fn is_monotonic(&self) -> bool {
        self.simple > 0 && self.simple <= self.medium && self.medium <= self.complex
    }

    /// Whether no cap exceeds the matching cap of `bound`
    #[must_use]
    pub fn within(&self, bound: &TierCaps) -> bool {
        self.simple <= bound.simple && self.medium <= bound.medium && self.complex <= bound.complex
    }
}

impl Default for TierCaps {
    fn default() -> Self {
        Self {
            simple: 5,
            medium: 10,
            complex: 15,
        }
    }
}

/// A single typed unit of work with declared dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier
    pub id: StepId,
    /// Step type
    pub step_type: StepType,
    /// Human-readable description
    pub description: String,
    /// Query or instruction passed to the capability
    pub action: String,
    /// Steps that must complete first (all smaller ids)
    pub dependencies: BTreeSet<StepId>,
    /// Expected output format or content
    pub expected_output: String,
}

impl Step {
    /// Whether `other` is a direct dependency
    #[inline]
    #[must_use]
    pub fn depends_on(&self, other: StepId) -> bool {
        self.dependencies.contains(&other)
    }
}

/// Validated dependency graph of typed steps for one request
///
/// Only [`PlanBuilder`](crate::builder::PlanBuilder) constructs plans. Once
/// built a plan is immutable. Deserialization re-checks the structural
/// invariants and the default tier caps so a tampered plan cannot enter the
/// scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PlanRecord")]
pub struct Plan {
    id: PlanId,
    question: String,
    analysis: String,
    tier: ComplexityTier,
    steps: Vec<Step>,
    expected_final_output: String,
}

impl Plan {
    pub(crate) fn new_unchecked(
        question: String,
        analysis: String,
        tier: ComplexityTier,
        steps: Vec<Step>,
        expected_final_output: String,
    ) -> Self {
        Self {
            id: PlanId::new(),
            question,
            analysis,
            tier,
            steps,
            expected_final_output,
        }
    }

    /// Plan identifier
    #[inline]
    #[must_use]
    pub fn id(&self) -> PlanId {
        self.id
    }

    /// Question the plan answers
    #[inline]
    #[must_use]
    pub fn question(&self) -> &str {
        &self.question
    }

    /// Planner's analysis of the question
    #[inline]
    #[must_use]
    pub fn analysis(&self) -> &str {
        &self.analysis
    }

    /// Assigned complexity tier
    #[inline]
    #[must_use]
    pub fn tier(&self) -> ComplexityTier {
        self.tier
    }

    /// Steps in submission order
    #[inline]
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Description of the final answer format
    #[inline]
    #[must_use]
    pub fn expected_final_output(&self) -> &str {
        &self.expected_final_output
    }

    /// Number of steps
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step by id
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|idx| &self.steps[idx])
    }

    /// Forward adjacency: edge `dependency -> dependent`
    #[must_use]
    pub fn graph(&self) -> DiGraphMap<StepId, ()> {
        dependency_graph(&self.steps)
    }

    /// Every step that depends on `id`, directly or transitively
    #[must_use]
    pub fn transitive_dependents(&self, id: StepId) -> BTreeSet<StepId> {
        let graph = self.graph();
        if !graph.contains_node(id) {
            return BTreeSet::new();
        }
        let mut dfs = Dfs::new(&graph, id);
        let mut out = BTreeSet::new();
        while let Some(node) = dfs.next(&graph) {
            if node != id {
                out.insert(node);
            }
        }
        out
    }
}

pub(crate) fn dependency_graph(steps: &[Step]) -> DiGraphMap<StepId, ()> {
    let mut graph = DiGraphMap::new();
    for step in steps {
        graph.add_node(step.id);
        for dep in &step.dependencies {
            graph.add_edge(*dep, step.id, ());
        }
    }
    graph
}

/// Serialized form of a plan, checked on the way back in
#[derive(Deserialize)]
struct PlanRecord {
    id: PlanId,
    question: String,
    analysis: String,
    tier: ComplexityTier,
    steps: Vec<Step>,
    expected_final_output: String,
}

impl TryFrom<PlanRecord> for Plan {
    type Error = String;

    fn try_from(record: PlanRecord) -> Result<Self, Self::Error> {
        let mut seen = HashSet::new();
        let mut prev: Option<StepId> = None;
        for step in &record.steps {
            if prev.is_some_and(|p| step.id <= p) {
                return Err(format!("step {} is out of order", step.id));
            }
            if let Some(dep) = step.dependencies.iter().find(|d| !seen.contains(*d)) {
                return Err(format!(
                    "step {} depends on {dep}, which is not an earlier step",
                    step.id
                ));
            }
            if step.action.trim().is_empty() {
                return Err(format!("step {} has an empty action", step.id));
            }
            seen.insert(step.id);
            prev = Some(step.id);
        }
        if record.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        let cap = TierCaps::default().cap(record.tier);
        if record.steps.len() > cap {
            return Err(format!(
                "{} steps exceed the {} tier cap of {cap}",
                record.steps.len(),
                record.tier
            ));
        }
        Ok(Self {
            id: record.id,
            question: record.question,
            analysis: record.analysis,
            tier: record.tier,
            steps: record.steps,
            expected_final_output: record.expected_final_output,
        })
    }
}

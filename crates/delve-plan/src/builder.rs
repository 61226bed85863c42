//! Plan construction and validation
//!
//! Performs all structural validation at construction time:
//! 1. Assign or verify monotonic step ids
//! 2. Build forward adjacency from dependencies
//! 3. Reject any dependency that is not an earlier step
//! 4. Classify complexity and enforce the tier cap
//!
//! Because every dependency must point at a smaller id, no back-reference
//! can close a loop and accepted plans are acyclic by construction.

use crate::error::PlanInvalid;
use crate::proposal::{PlanProposal, ProposedStep};
use crate::types::{
    dependency_graph, ComplexityTier, Plan, Step, StepId, StepType, TierCaps,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Inputs available to a complexity heuristic
#[derive(Debug, Clone, Copy)]
pub struct ComplexitySignals<'a> {
    /// Question text
    pub question: &'a str,
    /// Validated steps
    pub steps: &'a [Step],
    /// Tier declared by the planner, if any
    pub declared: Option<ComplexityTier>,
}

impl ComplexitySignals<'_> {
    /// Number of distinct data-gathering targets
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.step_type.is_data_gathering())
            .map(|s| s.action.trim().to_lowercase())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Longest chain of synthesis steps through the dependency graph
    #[must_use]
    pub fn comparison_depth(&self) -> usize {
        let mut depth: HashMap<StepId, usize> = HashMap::new();
        let mut max = 0;
        for step in self.steps {
            let inherited = step
                .dependencies
                .iter()
                .filter_map(|d| depth.get(d))
                .copied()
                .max()
                .unwrap_or(0);
            let own = inherited + usize::from(step.step_type.is_synthesis());
            max = max.max(own);
            depth.insert(step.id, own);
        }
        max
    }
}

/// Pluggable complexity classification
pub trait ComplexityHeuristic: Send + Sync + fmt::Debug {
    /// Assign a tier to a structurally valid step list
    fn classify(&self, signals: &ComplexitySignals<'_>) -> ComplexityTier;
}

/// Default heuristic: declared tier wins, otherwise entity count and
/// comparison depth decide
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalHeuristic;

impl ComplexityHeuristic for SignalHeuristic {
    fn classify(&self, signals: &ComplexitySignals<'_>) -> ComplexityTier {
        if let Some(declared) = signals.declared {
            return declared;
        }
        let entities = signals.entity_count();
        let depth = signals.comparison_depth();
        if entities <= 2 && depth <= 1 {
            ComplexityTier::Simple
        } else if entities <= 5 && depth <= 2 {
            ComplexityTier::Medium
        } else {
            ComplexityTier::Complex
        }
    }
}

/// Validates and normalizes proposed step graphs into executable plans
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    caps: TierCaps,
    heuristic: Arc<dyn ComplexityHeuristic>,
}

impl PlanBuilder {
    /// Create builder with default caps and heuristic
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: TierCaps::default(),
            heuristic: Arc::new(SignalHeuristic),
        }
    }

    /// With tier caps
    #[inline]
    #[must_use]
    pub fn with_caps(mut self, caps: TierCaps) -> Self {
        self.caps = caps;
        self
    }

    /// With complexity heuristic
    #[inline]
    #[must_use]
    pub fn with_heuristic(mut self, heuristic: Arc<dyn ComplexityHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    /// Configured caps
    #[inline]
    #[must_use]
    pub fn caps(&self) -> TierCaps {
        self.caps
    }

    /// Build a validated plan
    ///
    /// # Arguments
    /// * `question` - Raw question text
    /// * `prior_context` - Rendered prior turns, folded into fallback actions
    /// * `proposal` - Planner proposal; `None` yields the single web-search
    ///   fallback plan
    ///
    /// # Errors
    /// `PlanInvalid` describing the first violated invariant
    pub fn build(
        &self,
        question: &str,
        prior_context: Option<&str>,
        proposal: Option<PlanProposal>,
    ) -> Result<Plan, PlanInvalid> {
        let Some(proposal) = proposal else {
            return self.single_step(question, prior_context, StepType::WebSearch);
        };

        if proposal.steps.is_empty() {
            return Err(PlanInvalid::Malformed("plan has no steps".to_string()));
        }

        let steps = normalize_steps(&proposal.steps)?;

        // Structural acyclicity holds by the id ordering above; this guards
        // the adjacency itself.
        if petgraph::algo::toposort(&dependency_graph(&steps), None).is_err() {
            let step = steps.last().map_or(StepId(0), |s| s.id);
            return Err(PlanInvalid::Cycle {
                step,
                dependency: step,
            });
        }

        let declared = proposal
            .complexity
            .as_deref()
            .and_then(|c| c.parse::<ComplexityTier>().ok());
        let tier = self.heuristic.classify(&ComplexitySignals {
            question,
            steps: &steps,
            declared,
        });
        let cap = self.caps.cap(tier);
        if steps.len() > cap {
            return Err(PlanInvalid::CapExceeded {
                tier,
                cap,
                actual: steps.len(),
            });
        }

        let expected_final_output = if proposal.expected_final_output.is_empty() {
            "Answer to user question".to_string()
        } else {
            proposal.expected_final_output
        };

        let plan = Plan::new_unchecked(
            question.to_string(),
            proposal.analysis,
            tier,
            steps,
            expected_final_output,
        );
        tracing::debug!(
            plan_id = %plan.id(),
            tier = %plan.tier(),
            steps = plan.len(),
            "plan accepted"
        );
        Ok(plan)
    }

    /// Build a one-step plan routed to a single capability
    ///
    /// # Errors
    /// Only if the configured simple cap is zero
    pub fn single_step(
        &self,
        question: &str,
        prior_context: Option<&str>,
        step_type: StepType,
    ) -> Result<Plan, PlanInvalid> {
        let action = match prior_context {
            Some(ctx) if !ctx.trim().is_empty() => {
                format!("{}\n\nCurrent question: {question}", ctx.trim_end())
            }
            _ => question.to_string(),
        };
        let step = Step {
            id: StepId(1),
            step_type,
            description: format!("Answer directly via {step_type}"),
            action,
            dependencies: BTreeSet::new(),
            expected_output: "Answer to user question".to_string(),
        };
        let cap = self.caps.cap(ComplexityTier::Simple);
        if cap == 0 {
            return Err(PlanInvalid::CapExceeded {
                tier: ComplexityTier::Simple,
                cap,
                actual: 1,
            });
        }
        Ok(Plan::new_unchecked(
            question.to_string(),
            format!("Single-capability plan ({step_type})"),
            ComplexityTier::Simple,
            vec![step],
            "Answer to user question".to_string(),
        ))
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Steps 1-3 of validation: ids, types and dependency ordering
fn normalize_steps(proposed: &[ProposedStep]) -> Result<Vec<Step>, PlanInvalid> {
    let mut steps = Vec::with_capacity(proposed.len());
    let mut seen: HashSet<StepId> = HashSet::new();
    let mut prev: Option<StepId> = None;

    for raw in proposed {
        let id = StepId(
            raw.step_id
                .unwrap_or_else(|| prev.map_or(1, |p| p.0.saturating_add(1))),
        );
        if seen.contains(&id) {
            return Err(PlanInvalid::DuplicateId(id));
        }
        if let Some(p) = prev {
            if id < p {
                return Err(PlanInvalid::Malformed(format!(
                    "step id {id} follows {p}; ids must increase in submission order"
                )));
            }
        }

        let step_type: StepType = raw.step_type.parse().map_err(|_| PlanInvalid::UnknownType {
            step: id,
            found: raw.step_type.clone(),
        })?;

        let mut dependencies = BTreeSet::new();
        for &dep in &raw.dependencies {
            let dep = StepId(dep);
            if dep >= id {
                return Err(PlanInvalid::Cycle {
                    step: id,
                    dependency: dep,
                });
            }
            if !seen.contains(&dep) {
                return Err(PlanInvalid::Malformed(format!(
                    "step {id} depends on missing step {dep}"
                )));
            }
            dependencies.insert(dep);
        }

        if raw.action.trim().is_empty() {
            return Err(PlanInvalid::Malformed(format!("step {id} has an empty action")));
        }

        steps.push(Step {
            id,
            step_type,
            description: raw.description.clone(),
            action: raw.action.clone(),
            dependencies,
            expected_output: raw.expected_output.clone(),
        });
        seen.insert(id);
        prev = Some(id);
    }

    Ok(steps)
}

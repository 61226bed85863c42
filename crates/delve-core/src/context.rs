//! Execution and conversation context
//!
//! [`ExecutionContext`] is the per-plan record map written only by the
//! scheduler. Status moves forward only:
//!
//! ```text
//! Pending -> Running -> Done | Failed
//! Pending | Running -> Skipped
//! Pending -> Failed              (routing errors fail before dispatch)
//! ```
//!
//! [`ConversationContext`] is the immutable history of prior turns threaded
//! through a request in place of ambient global state.

use crate::capability::DependencyOutput;
use crate::error::{ContextError, StepErrorKind};
use delve_plan::{Plan, Step, StepId, StepType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet dispatched
    Pending,
    /// Capability call in flight
    Running,
    /// Completed with output
    Done,
    /// Failed
    Failed,
    /// Will not run
    Skipped,
}

impl StepStatus {
    /// Lower-case name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Whether the status is final
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Why a step was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency failed, directly or transitively
    UpstreamFailure {
        /// The step whose failure caused the skip
        failed: StepId,
    },
    /// Synthesis output was judged sufficient
    EarlyTermination,
}

/// Record of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step type
    pub step_type: StepType,
    /// Status
    pub status: StepStatus,
    /// Output text (empty unless done)
    pub output: String,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<StepErrorKind>,
    /// Skip reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Capability wall-clock time
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl StepRecord {
    fn pending(step_type: StepType) -> Self {
        Self {
            step_type,
            status: StepStatus::Pending,
            output: String::new(),
            error_kind: None,
            skip_reason: None,
            elapsed_ms: 0,
        }
    }
}

/// Per-plan map of step id to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    records: BTreeMap<StepId, StepRecord>,
}

impl ExecutionContext {
    /// Every step pending
    #[must_use]
    pub fn new(plan: &Plan) -> Self {
        let records = plan
            .steps()
            .iter()
            .map(|s| (s.id, StepRecord::pending(s.step_type)))
            .collect();
        Self { records }
    }

    /// Record for a step
    #[inline]
    #[must_use]
    pub fn get(&self, id: StepId) -> Option<&StepRecord> {
        self.records.get(&id)
    }

    /// Status of a step
    #[inline]
    #[must_use]
    pub fn status(&self, id: StepId) -> Option<StepStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    /// All records in step id order
    pub fn records(&self) -> impl Iterator<Item = (StepId, &StepRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Ids with the given status, ascending
    #[must_use]
    pub fn ids_with(&self, status: StepStatus) -> Vec<StepId> {
        self.records
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of steps with the given status
    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.records.values().filter(|r| r.status == status).count()
    }

    /// Total number of steps
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether there are no steps
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether every dependency of the step is done
    #[must_use]
    pub fn dependencies_done(&self, step: &Step) -> bool {
        step.dependencies
            .iter()
            .all(|d| self.status(*d) == Some(StepStatus::Done))
    }

    /// Outputs of the step's dependencies, ascending by step id
    #[must_use]
    pub fn dependency_outputs(&self, step: &Step) -> Vec<DependencyOutput> {
        step.dependencies
            .iter()
            .filter_map(|id| {
                let record = self.records.get(id)?;
                (record.status == StepStatus::Done).then(|| DependencyOutput {
                    step_id: *id,
                    step_type: record.step_type,
                    output: record.output.clone(),
                })
            })
            .collect()
    }

    /// Output of the highest-id done step
    #[must_use]
    pub fn final_output(&self) -> Option<(StepId, &str)> {
        self.records
            .iter()
            .rev()
            .find(|(_, r)| r.status == StepStatus::Done)
            .map(|(id, r)| (*id, r.output.as_str()))
    }

    /// Pending -> Running
    ///
    /// # Errors
    /// `ContextError` if the step is unknown or not pending
    pub fn mark_running(&mut self, id: StepId) -> Result<(), ContextError> {
        let record = self.transition(id, StepStatus::Running)?;
        record.status = StepStatus::Running;
        Ok(())
    }

    /// Running -> Done
    ///
    /// # Errors
    /// `ContextError` if the step is unknown or not running
    pub fn mark_done(&mut self, id: StepId, output: String, elapsed_ms: u64) -> Result<(), ContextError> {
        let record = self.transition(id, StepStatus::Done)?;
        record.status = StepStatus::Done;
        record.output = output;
        record.elapsed_ms = elapsed_ms;
        Ok(())
    }

    /// Pending | Running -> Failed
    ///
    /// # Errors
    /// `ContextError` if the step is unknown or already terminal
    pub fn mark_failed(
        &mut self,
        id: StepId,
        kind: StepErrorKind,
        elapsed_ms: u64,
    ) -> Result<(), ContextError> {
        let record = self.transition(id, StepStatus::Failed)?;
        record.status = StepStatus::Failed;
        record.error_kind = Some(kind);
        record.elapsed_ms = elapsed_ms;
        Ok(())
    }

    /// Pending | Running -> Skipped
    ///
    /// # Errors
    /// `ContextError` if the step is unknown or already terminal
    pub fn mark_skipped(&mut self, id: StepId, reason: SkipReason) -> Result<(), ContextError> {
        let record = self.transition(id, StepStatus::Skipped)?;
        record.status = StepStatus::Skipped;
        record.skip_reason = Some(reason);
        Ok(())
    }

    /// Running -> Pending, for a step paused on clarification
    ///
    /// # Errors
    /// `ContextError` if the step is unknown or not running
    pub fn mark_paused(&mut self, id: StepId) -> Result<(), ContextError> {
        let record = self.transition(id, StepStatus::Pending)?;
        record.status = StepStatus::Pending;
        Ok(())
    }

    fn transition(&mut self, id: StepId, to: StepStatus) -> Result<&mut StepRecord, ContextError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(ContextError::UnknownStep(id))?;
        let from = record.status;
        let allowed = matches!(
            (from, to),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Running, StepStatus::Done)
                | (StepStatus::Running, StepStatus::Pending)
                | (StepStatus::Pending | StepStatus::Running, StepStatus::Failed)
                | (StepStatus::Pending | StepStatus::Running, StepStatus::Skipped)
        );
        if !allowed {
            return Err(ContextError::IllegalTransition {
                step: id,
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        Ok(record)
    }
}

/// One prior question and its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Question asked
    pub question: String,
    /// Answer given
    pub answer: String,
}

/// Immutable history of prior turns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    /// Empty history
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New history with one more turn
    #[must_use]
    pub fn with_turn(&self, question: impl Into<String>, answer: impl Into<String>) -> Self {
        let mut turns = self.turns.clone();
        turns.push(Turn {
            question: question.into(),
            answer: answer.into(),
        });
        Self { turns }
    }

    /// Prior turns, oldest first
    #[inline]
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Whether there are no prior turns
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Answer of the most recent turn
    #[must_use]
    pub fn last_answer(&self) -> Option<&str> {
        self.turns.last().map(|t| t.answer.as_str())
    }

    /// Render the last `window` turns
    ///
    /// Empty when there is no history or `window` is zero.
    #[must_use]
    pub fn render(&self, window: usize) -> String {
        let start = self.turns.len().saturating_sub(window);
        let mut out = String::new();
        for turn in &self.turns[start..] {
            let _ = write!(
                out,
                "Previous Q: {}\nPrevious A: {}\n\n",
                turn.question, turn.answer
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use delve_plan::{PlanBuilder, PlanProposal, ProposedStep};

    fn plan() -> Plan {
        PlanBuilder::new()
            .build(
                "q",
                None,
                Some(PlanProposal::new(vec![
                    ProposedStep::new("kb_query", "a"),
                    ProposedStep::new("web_search", "b"),
                    ProposedStep::new("aggregate", "c").depends_on(1).depends_on(2),
                ])),
            )
            .unwrap()
    }

    #[test]
    fn starts_pending() {
        let ctx = ExecutionContext::new(&plan());
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.count(StepStatus::Pending), 3);
        assert!(ctx.final_output().is_none());
    }

    #[test]
    fn forward_transitions_only() {
        let mut ctx = ExecutionContext::new(&plan());
        ctx.mark_running(StepId(1)).unwrap();
        ctx.mark_done(StepId(1), "one".into(), 5).unwrap();

        let err = ctx.mark_running(StepId(1)).unwrap_err();
        assert_eq!(
            err,
            ContextError::IllegalTransition {
                step: StepId(1),
                from: "done",
                to: "running"
            }
        );
        assert!(ctx.mark_done(StepId(2), "x".into(), 0).is_err());
        assert_eq!(ctx.mark_running(StepId(7)), Err(ContextError::UnknownStep(StepId(7))));
    }

    #[test]
    fn dependency_outputs_are_ordered_by_id() {
        let plan = plan();
        let mut ctx = ExecutionContext::new(&plan);
        ctx.mark_running(StepId(2)).unwrap();
        ctx.mark_running(StepId(1)).unwrap();
        ctx.mark_done(StepId(2), "two".into(), 0).unwrap();
        assert!(!ctx.dependencies_done(&plan.steps()[2]));
        ctx.mark_done(StepId(1), "one".into(), 0).unwrap();
        assert!(ctx.dependencies_done(&plan.steps()[2]));

        let outputs: Vec<_> = ctx
            .dependency_outputs(&plan.steps()[2])
            .into_iter()
            .map(|d| d.output)
            .collect();
        assert_eq!(outputs, vec!["one", "two"]);
        assert_eq!(ctx.final_output(), Some((StepId(2), "two")));
    }

    #[test]
    fn paused_step_returns_to_pending() {
        let mut ctx = ExecutionContext::new(&plan());
        ctx.mark_running(StepId(1)).unwrap();
        ctx.mark_paused(StepId(1)).unwrap();
        assert_eq!(ctx.status(StepId(1)), Some(StepStatus::Pending));
    }

    #[test]
    fn conversation_renders_window() {
        let conv = ConversationContext::new()
            .with_turn("q1", "a1")
            .with_turn("q2", "a2")
            .with_turn("q3", "a3");
        assert_eq!(
            conv.render(2),
            "Previous Q: q2\nPrevious A: a2\n\nPrevious Q: q3\nPrevious A: a3\n\n"
        );
        assert_eq!(conv.render(0), "");
        assert_eq!(conv.last_answer(), Some("a3"));
        assert_eq!(ConversationContext::new().last_answer(), None);
    }

    #[test]
    fn with_turn_leaves_original_untouched() {
        let base = ConversationContext::new();
        let next = base.with_turn("q", "a");
        assert!(base.is_empty());
        assert_eq!(next.turns().len(), 1);
    }
}

//! Final answer assembly

use crate::capability::RequestKind;
use crate::context::{ExecutionContext, SkipReason, StepRecord, StepStatus};
use crate::stages::Report;
use delve_plan::StepId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Text returned when no step produced output
pub const NO_RESULTS: &str = "No results available";

/// Why an answer is less than complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "caveat", rename_all = "snake_case")]
pub enum Caveat {
    /// Synthesis was judged sufficient and remaining steps skipped
    EarlyTermination {
        /// Skipped step count
        skipped: usize,
    },
    /// Some steps failed or were skipped after a failure
    PartialFailure {
        /// Failed steps
        failed: Vec<StepId>,
        /// Steps skipped because of them
        skipped: Vec<StepId>,
    },
    /// Clarification rounds ran out and defaults were assumed
    LenientDefaultsApplied {
        /// Assumptions made
        assumptions: Vec<String>,
    },
    /// Report generation failed and raw material was returned
    DegradedReport,
    /// A report was requested with no prior answer to build on
    NoSourceMaterial,
    /// No step completed
    NoResults,
}

impl Caveat {
    /// One-line note for the caller
    #[must_use]
    pub fn note(&self) -> String {
        match self {
            Caveat::EarlyTermination { skipped } => {
                format!("Answered early from synthesized results; {skipped} remaining step(s) were skipped.")
            }
            Caveat::PartialFailure { failed, skipped } => format!(
                "{} step(s) failed and {} dependent step(s) were skipped; the answer may be incomplete.",
                failed.len(),
                skipped.len()
            ),
            Caveat::LenientDefaultsApplied { assumptions } => {
                format!("Assumed: {}.", assumptions.join("; "))
            }
            Caveat::DegradedReport => {
                "The report could not be generated; the collected source material is shown instead.".to_string()
            }
            Caveat::NoSourceMaterial => {
                "A report needs a preceding analysis. Ask the question first, then request the report.".to_string()
            }
            Caveat::NoResults => "No step produced a result.".to_string(),
        }
    }
}

/// Answer to one top-level request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    /// Answer text
    pub text: String,
    /// Request class that produced it
    pub kind: RequestKind,
    /// Explicit caveats
    pub caveats: Vec<Caveat>,
    /// Per-step records of the executed plan
    pub step_records: BTreeMap<StepId, StepRecord>,
    /// Done steps as a percentage of all steps
    pub success_rate: f64,
    /// Whether the answer is degraded
    pub degraded: bool,
}

impl FinalAnswer {
    /// Assemble from finished execution records
    ///
    /// The text is the output of the highest-id done step.
    #[must_use]
    pub fn from_execution(kind: RequestKind, context: &ExecutionContext, early_terminated: bool) -> Self {
        let mut caveats = Vec::new();

        let text = match context.final_output() {
            Some((_, output)) => output.to_string(),
            None => {
                caveats.push(Caveat::NoResults);
                NO_RESULTS.to_string()
            }
        };

        if early_terminated {
            caveats.push(Caveat::EarlyTermination {
                skipped: context.count(StepStatus::Skipped),
            });
        }

        let failed = context.ids_with(StepStatus::Failed);
        if !failed.is_empty() {
            let skipped = context
                .records()
                .filter(|(_, r)| matches!(r.skip_reason, Some(SkipReason::UpstreamFailure { .. })))
                .map(|(id, _)| id)
                .collect();
            caveats.push(Caveat::PartialFailure { failed, skipped });
        }

        let success_rate = percent(context.count(StepStatus::Done), context.len());

        let degraded = caveats
            .iter()
            .any(|c| matches!(c, Caveat::NoResults | Caveat::PartialFailure { .. }));

        Self {
            text,
            kind,
            caveats,
            step_records: context.records().map(|(id, r)| (id, r.clone())).collect(),
            success_rate,
            degraded,
        }
    }

    /// Assemble from a generated report
    #[must_use]
    pub fn from_report(report: Report) -> Self {
        let mut caveats = Vec::new();
        if report.degraded {
            caveats.push(Caveat::DegradedReport);
        }
        Self {
            text: report.body,
            kind: RequestKind::Report,
            caveats,
            step_records: BTreeMap::new(),
            success_rate: if report.degraded { 0.0 } else { 100.0 },
            degraded: report.degraded,
        }
    }

    /// Report requested without prior material
    #[must_use]
    pub fn no_source_material() -> Self {
        Self {
            text: Caveat::NoSourceMaterial.note(),
            kind: RequestKind::Report,
            caveats: vec![Caveat::NoSourceMaterial],
            step_records: BTreeMap::new(),
            success_rate: 0.0,
            degraded: true,
        }
    }

    /// With an extra caveat
    #[inline]
    #[must_use]
    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveats.push(caveat);
        self
    }

    /// Answer text followed by caveat notes
    #[must_use]
    pub fn render(&self) -> String {
        let notes: Vec<String> = self
            .caveats
            .iter()
            .filter(|c| !matches!(c, Caveat::NoSourceMaterial))
            .map(Caveat::note)
            .collect();
        if notes.is_empty() {
            return self.text.clone();
        }
        let mut out = self.text.clone();
        out.push_str("\n\n---\n");
        for note in notes {
            let _ = writeln!(out, "Note: {note}");
        }
        out
    }
}

/// `part` as a percentage of `whole`; zero when `whole` is zero
fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let as_f64 = |n: usize| f64::from(u32::try_from(n).unwrap_or(u32::MAX));
    as_f64(part) / as_f64(whole) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepErrorKind;
    use delve_plan::{PlanBuilder, PlanProposal, ProposedStep};

    fn context() -> ExecutionContext {
        let plan = PlanBuilder::new()
            .build(
                "q",
                None,
                Some(PlanProposal::new(vec![
                    ProposedStep::new("kb_query", "a"),
                    ProposedStep::new("web_search", "b"),
                    ProposedStep::new("aggregate", "c").depends_on(1).depends_on(2),
                    ProposedStep::new("kb_query", "d"),
                ])),
            )
            .unwrap();
        ExecutionContext::new(&plan)
    }

    #[test]
    fn text_is_highest_done_step() {
        let mut ctx = context();
        for (id, out) in [(1, "one"), (2, "two"), (4, "four")] {
            ctx.mark_running(StepId(id)).unwrap();
            ctx.mark_done(StepId(id), out.into(), 1).unwrap();
        }
        ctx.mark_running(StepId(3)).unwrap();
        ctx.mark_done(StepId(3), "three".into(), 1).unwrap();

        let answer = FinalAnswer::from_execution(RequestKind::Plan, &ctx, false);
        assert_eq!(answer.text, "four");
        assert!(answer.caveats.is_empty());
        assert!((answer.success_rate - 100.0).abs() < f64::EPSILON);
        assert_eq!(answer.render(), "four");
    }

    #[test]
    fn failures_are_caveated() {
        let mut ctx = context();
        ctx.mark_running(StepId(1)).unwrap();
        ctx.mark_done(StepId(1), "one".into(), 1).unwrap();
        ctx.mark_failed(StepId(2), StepErrorKind::capability("down"), 1).unwrap();
        ctx.mark_skipped(StepId(3), SkipReason::UpstreamFailure { failed: StepId(2) })
            .unwrap();
        ctx.mark_running(StepId(4)).unwrap();
        ctx.mark_done(StepId(4), "four".into(), 1).unwrap();

        let answer = FinalAnswer::from_execution(RequestKind::Plan, &ctx, false);
        assert_eq!(
            answer.caveats,
            vec![Caveat::PartialFailure {
                failed: vec![StepId(2)],
                skipped: vec![StepId(3)]
            }]
        );
        assert!(answer.degraded);
        assert!((answer.success_rate - 50.0).abs() < f64::EPSILON);
        assert!(answer.render().contains("Note: 1 step(s) failed"));
    }

    #[test]
    fn nothing_done_means_no_results() {
        let mut ctx = context();
        for id in 1..=4 {
            ctx.mark_failed(StepId(id), StepErrorKind::capability("x"), 0).unwrap();
        }
        let answer = FinalAnswer::from_execution(RequestKind::Plan, &ctx, false);
        assert_eq!(answer.text, NO_RESULTS);
        assert!(answer.caveats.contains(&Caveat::NoResults));
    }

    #[test]
    fn percent_of_counts() {
        assert!((percent(1, 3) - 100.0 / 3.0).abs() < 1e-9);
        assert!((percent(15, 15) - 100.0).abs() < f64::EPSILON);
        assert!(percent(0, 0).abs() < f64::EPSILON);
    }

    #[test]
    fn serializes_to_json() {
        let answer = FinalAnswer::no_source_material();
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json["kind"], "report");
        assert_eq!(json["caveats"][0]["caveat"], "no_source_material");
    }
}

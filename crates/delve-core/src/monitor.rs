//! Early termination policy
//!
//! After a synthesis step completes, decide whether the rest of the plan is
//! only more data gathering that the synthesis already made redundant.

use crate::config::EarlyTerminationConfig;
use delve_plan::StepType;
use std::collections::BTreeSet;

/// Monitor verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Keep scheduling
    Continue,
    /// Skip every step not yet finished
    Terminate,
}

/// Length-and-type predicate over a completed step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EarlyTerminationMonitor {
    threshold_chars: usize,
    trigger_types: BTreeSet<StepType>,
    gathering_types: BTreeSet<StepType>,
}

impl EarlyTerminationMonitor {
    /// Create from configuration
    #[must_use]
    pub fn new(config: &EarlyTerminationConfig) -> Self {
        Self {
            threshold_chars: config.threshold_chars,
            trigger_types: config.trigger_types.clone(),
            gathering_types: config.gathering_types.clone(),
        }
    }

    /// Output length that must be exceeded
    #[inline]
    #[must_use]
    pub fn threshold_chars(&self) -> usize {
        self.threshold_chars
    }

    /// Whether the step type is evaluated at all
    #[inline]
    #[must_use]
    pub fn is_trigger(&self, step_type: StepType) -> bool {
        self.trigger_types.contains(&step_type)
    }

    /// Evaluate after a step completes
    ///
    /// `remaining` holds the types of every step not yet finished, the
    /// completed one excluded. Non-trigger completions always continue, and
    /// so does an empty remainder: there is nothing left to skip.
    #[must_use]
    pub fn evaluate<I>(&self, completed: StepType, output: &str, remaining: I) -> Verdict
    where
        I: IntoIterator<Item = StepType>,
    {
        if !self.is_trigger(completed) {
            return Verdict::Continue;
        }
        if output.chars().count() <= self.threshold_chars {
            return Verdict::Continue;
        }
        let mut any = false;
        for step_type in remaining {
            if !self.gathering_types.contains(&step_type) {
                return Verdict::Continue;
            }
            any = true;
        }
        if any {
            Verdict::Terminate
        } else {
            Verdict::Continue
        }
    }
}

impl Default for EarlyTerminationMonitor {
    fn default() -> Self {
        Self::new(&EarlyTerminationConfig::default())
    }
}

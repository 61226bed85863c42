//! Clarification dialogue
//!
//! A bounded pause/resume state machine:
//!
//! ```text
//! Gathering -> AwaitingUser -> Gathering -> ... -> Resolved
//! Gathering -> Aborted            (rounds exhausted, lenient defaults)
//! ```
//!
//! The round counter never exceeds the configured maximum. A signal that
//! arrives once the maximum is reached aborts the dialogue instead of asking
//! again, so every request eventually answers.

use crate::config::{ClarificationConfig, LenientDefaults};
use crate::error::OrchestratorError;
use delve_plan::StepId;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

static UNQUALIFIED_ENTITIES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:major|leading|main|key|top|big|largest)\s+(?:companies|company|firms|players|competitors|peers|corporations)\b|주요\s*(?:회사|기업)",
    )
    .expect("static pattern")
});

static UNQUALIFIED_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:recent|recently|latest|lately|current|this year)\b|최근")
        .expect("static pattern")
});

static UNQUALIFIED_DEGREE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bhow (?:well|good|much better)\b|어느 정도").expect("static pattern")
});

/// Dialogue status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClarificationStatus {
    /// Executing, collecting signals
    Gathering,
    /// Questions surfaced, waiting for answers
    AwaitingUser,
    /// Final answer produced
    Resolved,
    /// Rounds exhausted, lenient defaults in force
    Aborted,
}

impl ClarificationStatus {
    fn allowed_transitions(self) -> &'static [ClarificationStatus] {
        match self {
            Self::Gathering => &[Self::AwaitingUser, Self::Resolved, Self::Aborted],
            Self::AwaitingUser => &[Self::Gathering],
            Self::Aborted => &[Self::Resolved],
            Self::Resolved => &[],
        }
    }

    fn can_move_to(self, to: ClarificationStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

/// State of the clarification dialogue for one top-level request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationState {
    /// Rounds asked so far
    pub round: u32,
    /// Step awaiting input; `None` when the planner asked
    pub pending_step_id: Option<StepId>,
    /// Questions of the current round, in order
    pub questions: Vec<String>,
    /// Status
    pub status: ClarificationStatus,
}

impl ClarificationState {
    /// Fresh dialogue
    #[must_use]
    pub fn new() -> Self {
        Self {
            round: 0,
            pending_step_id: None,
            questions: Vec::new(),
            status: ClarificationStatus::Gathering,
        }
    }

    /// Whether lenient defaults are in force
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.status == ClarificationStatus::Aborted
    }
}

impl Default for ClarificationState {
    fn default() -> Self {
        Self::new()
    }
}

/// One answered question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaPair {
    /// Question asked (empty for free context)
    pub question: String,
    /// Caller's answer
    pub answer: String,
}

/// What to do with a clarification signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Surface the questions to the caller
    Ask,
    /// Stop asking and apply lenient defaults
    Abort,
}

/// Round-capped clarification state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClarificationController {
    max_rounds: u32,
    lenient: LenientDefaults,
}

impl ClarificationController {
    /// Create from configuration
    #[must_use]
    pub fn new(config: &ClarificationConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            lenient: config.lenient.clone(),
        }
    }

    /// Rounds before lenient defaults
    #[inline]
    #[must_use]
    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Handle a "cannot proceed" signal
    pub fn on_signal(
        &self,
        state: &mut ClarificationState,
        step: Option<StepId>,
        questions: Vec<String>,
    ) -> Decision {
        if state.round >= self.max_rounds {
            state.status = ClarificationStatus::Aborted;
            state.pending_step_id = None;
            state.questions.clear();
            tracing::warn!(
                round = state.round,
                max_rounds = self.max_rounds,
                "clarification rounds exhausted, applying lenient defaults"
            );
            return Decision::Abort;
        }
        state.round += 1;
        state.status = ClarificationStatus::AwaitingUser;
        state.pending_step_id = step;
        state.questions = questions;
        tracing::info!(
            round = state.round,
            step_id = ?step.map(|s| s.0),
            questions = state.questions.len(),
            "clarification requested"
        );
        Decision::Ask
    }

    /// Pair the caller's answers with the pending questions
    ///
    /// Missing answers pair with an empty string; extra answers become free
    /// context with an empty question.
    ///
    /// # Errors
    /// `OrchestratorError::Resume` unless the dialogue is awaiting the user
    pub fn accept_answers(
        &self,
        state: &mut ClarificationState,
        answers: Vec<String>,
    ) -> Result<Vec<QaPair>, OrchestratorError> {
        transition(state, ClarificationStatus::Gathering)?;

        let mut answers = answers.into_iter();
        let mut pairs: Vec<QaPair> = state
            .questions
            .drain(..)
            .map(|question| QaPair {
                question,
                answer: answers.next().unwrap_or_default(),
            })
            .collect();
        pairs.extend(answers.map(|answer| QaPair {
            question: String::new(),
            answer,
        }));
        Ok(pairs)
    }

    /// Mark the dialogue finished
    pub fn resolve(&self, state: &mut ClarificationState) {
        if state.status.can_move_to(ClarificationStatus::Resolved) {
            state.status = ClarificationStatus::Resolved;
        }
    }

    /// Documented substitutions for an under-specified question
    #[must_use]
    pub fn lenient_assumptions(&self, question: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(m) = UNQUALIFIED_ENTITIES.find(question) {
            out.push(format!(
                "\"{}\" means the top {} by {}",
                m.as_str(),
                self.lenient.top_n,
                self.lenient.ranking_signal
            ));
        }
        if let Some(m) = UNQUALIFIED_TIME.find(question) {
            out.push(format!("\"{}\" means {}", m.as_str(), self.lenient.recent_period));
        }
        if let Some(m) = UNQUALIFIED_DEGREE.find(question) {
            out.push(format!("\"{}\" is judged against the industry average", m.as_str()));
        }
        out.push("Anything else unspecified uses reasonable assumptions".to_string());
        out
    }
}

impl Default for ClarificationController {
    fn default() -> Self {
        Self::new(&ClarificationConfig::default())
    }
}

fn transition(
    state: &mut ClarificationState,
    to: ClarificationStatus,
) -> Result<(), OrchestratorError> {
    if !state.status.can_move_to(to) {
        return Err(OrchestratorError::Resume(format!(
            "clarification is {:?}, cannot move to {:?}",
            state.status, to
        )));
    }
    state.status = to;
    Ok(())
}

/// Notes block appended to step prompts
///
/// `None` when there is nothing to add.
#[must_use]
pub fn context_notes(qa: &[QaPair], assumptions: &[String]) -> Option<String> {
    if qa.is_empty() && assumptions.is_empty() {
        return None;
    }
    let mut out = String::new();
    if !qa.is_empty() {
        out.push_str("Additional context:\n");
        for pair in qa {
            if pair.question.is_empty() {
                let _ = writeln!(out, "- {}", pair.answer);
            } else {
                let _ = writeln!(out, "- {}: {}", pair.question, pair.answer);
            }
        }
    }
    if !assumptions.is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("Assumptions:\n");
        for assumption in assumptions {
            let _ = writeln!(out, "- {assumption}");
        }
    }
    Some(out)
}

/// Merge answers and assumptions into the original question
#[must_use]
pub fn merge(original: &str, qa: &[QaPair], assumptions: &[String]) -> String {
    match context_notes(qa, assumptions) {
        Some(notes) => format!("Original question: {original}\n\n{notes}"),
        None => original.to_string(),
    }
}

//! Error types for Delve Core
//!
//! Provides error handling for:
//! - Plan validation failures (the only request-fatal kind)
//! - Step-level failures recorded in the execution context
//! - Stage generation failures (always degraded, never surfaced)
//! - Configuration errors

use delve_plan::{PlanInvalid, RoutingError, StepId};
use serde::{Deserialize, Serialize};

/// Top-level orchestrator error
///
/// Only `PlanInvalid` aborts a request outright. Step and stage failures
/// degrade into a partial answer instead of reaching this type.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Proposed plan failed validation
    #[error("plan invalid: {0}")]
    PlanInvalid(#[from] PlanInvalid),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resume payload does not describe a paused request
    #[error("cannot resume: {0}")]
    Resume(String),
}

impl OrchestratorError {
    /// Check if the caller should re-plan or answer with a single capability
    #[inline]
    #[must_use]
    pub fn requires_replan(&self) -> bool {
        matches!(self, Self::PlanInvalid(_))
    }
}

/// Why a step failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepErrorKind {
    /// No capability for the step type
    #[error("{0}")]
    Routing(RoutingError),

    /// Capability exceeded its timeout budget
    #[error("capability timed out after {ms}ms")]
    Timeout {
        /// Budget in milliseconds
        ms: u64,
    },

    /// Capability reported a failure
    #[error("capability error: {message}")]
    Capability {
        /// Capability-supplied reason
        message: String,
    },

    /// Capability asked for clarification after rounds were exhausted
    #[error("capability still requested clarification after lenient defaults")]
    ClarificationRefused,
}

impl StepErrorKind {
    /// Capability failure with a message
    #[inline]
    #[must_use]
    pub fn capability(message: impl Into<String>) -> Self {
        Self::Capability {
            message: message.into(),
        }
    }
}

impl From<RoutingError> for StepErrorKind {
    fn from(err: RoutingError) -> Self {
        Self::Routing(err)
    }
}

/// Stage generation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Stage exceeded its wall-clock ceiling
    #[error("stage {stage} timed out after {secs}s")]
    Timeout {
        /// Stage index
        stage: u8,
        /// Ceiling in seconds
        secs: u64,
    },

    /// Generator reported a failure
    #[error("stage generation failed: {0}")]
    Generation(String),
}

/// Execution context record errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// Step is not part of the plan
    #[error("unknown step {0}")]
    UnknownStep(StepId),

    /// Record cannot move between these states
    #[error("illegal transition for step {step}: {from} -> {to}")]
    IllegalTransition {
        /// Step
        step: StepId,
        /// Current status
        from: &'static str,
        /// Requested status
        to: &'static str,
    },
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Could not read the config file
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config is not valid TOML for the schema
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but violates a constraint
    #[error("invalid config: {0}")]
    Invalid(String),
}

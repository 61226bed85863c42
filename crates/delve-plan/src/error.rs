//! Error types for plan construction and routing
//!
//! Provides error handling for:
//! - Plan validation failures (fatal to the plan)
//! - Step routing failures (fatal only to the step)
//! - Planner proposal parsing

use crate::types::{ComplexityTier, StepId, StepType};
use serde::{Deserialize, Serialize};

/// Validation failure for a proposed step graph
///
/// A `PlanInvalid` is fatal to the plan it describes. Callers re-plan or fall
/// back to a single-capability answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanInvalid {
    /// A dependency references the step itself or a later step
    #[error("step {step} depends on {dependency}, which is not an earlier step")]
    Cycle {
        /// Referencing step
        step: StepId,
        /// Offending dependency id
        dependency: StepId,
    },

    /// Step count exceeds the cap of the assigned tier
    #[error("{actual} steps exceed the {tier} tier cap of {cap}")]
    CapExceeded {
        /// Assigned tier
        tier: ComplexityTier,
        /// Cap for that tier
        cap: usize,
        /// Submitted step count
        actual: usize,
    },

    /// Step type is not one of the known types
    #[error("step {step} has unknown type {found:?}")]
    UnknownType {
        /// Step with the bad type
        step: StepId,
        /// Type text as submitted
        found: String,
    },

    /// Two steps share an id
    #[error("duplicate step id {0}")]
    DuplicateId(StepId),

    /// Structurally malformed proposal
    #[error("malformed plan: {0}")]
    Malformed(String),
}

impl PlanInvalid {
    /// Short machine-readable tag for the failure kind
    #[inline]
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Cycle { .. } => "cycle",
            Self::CapExceeded { .. } => "cap-exceeded",
            Self::UnknownType { .. } => "unknown-type",
            Self::DuplicateId(_) => "duplicate-id",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// No capability is mapped for a step type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("no capability mapped for step type {step_type}")]
pub struct RoutingError {
    /// The unmapped step type
    pub step_type: StepType,
}

/// Step type text did not match a known type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown step type: {0}")]
pub struct UnknownStepType(pub String);

/// Planner reply could not be turned into a proposal
#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    /// Reply contained no JSON object
    #[error("planner reply contains no JSON object")]
    NoJson,

    /// JSON did not match the proposal schema
    #[error("planner reply is not a valid proposal: {0}")]
    Json(#[from] serde_json::Error),
}

//! Delve Plan - step graph model and construction phase
//!
//! Turns a planner's proposed step list into a validated, immutable
//! [`Plan`]:
//! - Monotonic step ids, dependencies only on earlier steps
//! - Complexity tier classification with a hard step cap per tier
//! - Static routing of step types to capability classes
//!
//! # Example
//!
//! ```rust
//! use delve_plan::{PlanBuilder, PlanProposal, ProposedStep, StepRouter, CapabilityKind};
//!
//! let proposal = PlanProposal::new(vec![
//!     ProposedStep::new("kb_query", "internal safety metrics"),
//!     ProposedStep::new("web_search", "peer safety metrics"),
//!     ProposedStep::new("compare", "compare the two").depends_on(1).depends_on(2),
//! ]);
//!
//! let plan = PlanBuilder::new()
//!     .build("How does our LTIR compare?", None, Some(proposal))
//!     .unwrap();
//!
//! let router = StepRouter::new();
//! let last = &plan.steps()[2];
//! assert_eq!(router.route(last.step_type), Ok(CapabilityKind::Synthesis));
//! ```

#![warn(unreachable_pub)]

pub mod builder;
pub mod error;
pub mod proposal;
pub mod router;
pub mod types;

pub use builder::{ComplexityHeuristic, ComplexitySignals, PlanBuilder, SignalHeuristic};
pub use error::{PlanInvalid, ProposalError, RoutingError, UnknownStepType};
pub use proposal::{PlanProposal, ProposedStep};
pub use router::{CapabilityKind, StepRouter};
pub use types::{ComplexityTier, Plan, PlanId, Step, StepId, StepType, TierCaps};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

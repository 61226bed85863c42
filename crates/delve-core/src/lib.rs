//! Delve Core - plan execution
//!
//! Runs validated plans against external capabilities:
//! - Bounded-concurrency dependency scheduling with local failure handling
//! - Early termination once synthesis output is sufficient
//! - A round-capped clarification dialogue with lenient defaults
//! - Three-stage long-form report generation
//!
//! # Example
//!
//! ```rust,ignore
//! use delve_core::prelude::*;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), OrchestratorError> {
//! let orchestrator = Orchestrator::new(OrchestratorConfig::new(), collaborators)?;
//! let conversation = ConversationContext::new();
//!
//! match orchestrator.execute_plan("How does our LTIR compare?", &conversation).await? {
//!     Outcome::Answer(answer) => println!("{}", answer.render()),
//!     Outcome::Clarification(request) => {
//!         let answers = vec!["Companies A and B".to_string()];
//!         let next = orchestrator.resume_with_answers(request.state, answers).await?;
//!         println!("{next:?}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

pub mod answer;
pub mod capability;
pub mod clarification;
pub mod config;
pub mod context;
pub mod error;
pub mod markup;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod stages;

pub use answer::{Caveat, FinalAnswer, NO_RESULTS};
pub use capability::{
    parse_clarification, Capability, CapabilityOutcome, CapabilityRegistry, Classifier,
    DependencyOutput, Planner, RequestKind, SharedContext, StageGenerator, StepInput,
    CLARIFICATION_MARKER,
};
pub use clarification::{
    ClarificationController, ClarificationState, ClarificationStatus, Decision, QaPair,
};
pub use config::{
    ClarificationConfig, ContextConfig, EarlyTerminationConfig, LenientDefaults,
    OrchestratorConfig, PlanConfig, SchedulerConfig, StageConfig,
};
pub use context::{
    ConversationContext, ExecutionContext, SkipReason, StepRecord, StepStatus, Turn,
};
pub use error::{ConfigError, ContextError, OrchestratorError, StageError, StepErrorKind};
pub use markup::{is_lightweight_markup, normalize_markup};
pub use monitor::{EarlyTerminationMonitor, Verdict};
pub use orchestrator::{ClarificationRequest, Collaborators, Orchestrator, Outcome, SuspendedState};
pub use scheduler::{DependencyScheduler, ScheduleOutcome};
pub use stages::{Report, StageIndex, StageJob, StageSplitter, TopicSpec};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Delve Core
    pub use crate::{
        Capability, CapabilityOutcome, CapabilityRegistry, Classifier, ClarificationRequest,
        Collaborators, ConversationContext, FinalAnswer, Orchestrator, OrchestratorConfig,
        OrchestratorError, Outcome, Planner, RequestKind, SharedContext, StageGenerator,
        StepInput, SuspendedState,
    };
    pub use delve_plan::{CapabilityKind, StepType};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Orchestrator configuration
//!
//! Every tunable of the execution core lives here: concurrency, early
//! termination policy, clarification rounds and lenient defaults, stage
//! budgets and tier caps. Every field has a default and the whole struct
//! loads from TOML.

use crate::error::ConfigError;
use delve_plan::{StepType, TierCaps};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Dependency scheduler settings
    pub scheduler: SchedulerConfig,
    /// Early termination policy
    pub early_termination: EarlyTerminationConfig,
    /// Clarification dialogue settings
    pub clarification: ClarificationConfig,
    /// Long-form stage settings
    pub stages: StageConfig,
    /// Plan validation settings
    pub plan: PlanConfig,
    /// Conversation context settings
    pub context: ContextConfig,
}

impl OrchestratorConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load, parse and validate a TOML file
    ///
    /// # Errors
    /// `ConfigError::Io`, `ConfigError::Parse` or `ConfigError::Invalid`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// With max concurrency
    #[inline]
    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.scheduler.max_concurrency = max;
        self
    }

    /// With early termination threshold
    #[inline]
    #[must_use]
    pub fn with_termination_threshold(mut self, chars: usize) -> Self {
        self.early_termination.threshold_chars = chars;
        self
    }

    /// With max clarification rounds
    #[inline]
    #[must_use]
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.clarification.max_rounds = rounds;
        self
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.scheduler.max_concurrency == 0 {
            return invalid("scheduler.max_concurrency must be at least 1");
        }
        if self.scheduler.step_timeout_secs == 0 {
            return invalid("scheduler.step_timeout_secs must be at least 1");
        }
        if self.clarification.max_rounds == 0 {
            return invalid("clarification.max_rounds must be at least 1");
        }
        if self.clarification.lenient.top_n == 0 {
            return invalid("clarification.lenient.top_n must be at least 1");
        }
        if self.stages.stage_timeout_secs == 0 {
            return invalid("stages.stage_timeout_secs must be at least 1");
        }
        let ratio = self.stages.retry_budget_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return invalid("stages.retry_budget_ratio must be in (0, 1]");
        }
        if !self.plan.caps.is_monotonic() {
            return invalid("plan.caps must be non-zero and non-decreasing by tier");
        }
        if !self.plan.caps.within(&TierCaps::default()) {
            return invalid("plan.caps may tighten but not exceed 5/10/15");
        }
        let et = &self.early_termination;
        if et.trigger_types.is_empty() {
            return invalid("early_termination.trigger_types must not be empty");
        }
        if !et.trigger_types.is_disjoint(&et.gathering_types) {
            return invalid("early_termination trigger and gathering types overlap");
        }
        Ok(())
    }
}

/// Dependency scheduler settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running steps
    pub max_concurrency: usize,
    /// Timeout per capability call
    pub step_timeout_secs: u64,
}

impl SchedulerConfig {
    /// Step timeout as a duration
    #[inline]
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            step_timeout_secs: 60,
        }
    }
}

/// Early termination policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyTerminationConfig {
    /// Output length (in characters) that must be exceeded
    pub threshold_chars: usize,
    /// Step types after which the policy is evaluated
    pub trigger_types: BTreeSet<StepType>,
    /// Step types that may be skipped
    pub gathering_types: BTreeSet<StepType>,
}

impl Default for EarlyTerminationConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 800,
            trigger_types: [StepType::Aggregate, StepType::Compare].into_iter().collect(),
            gathering_types: [StepType::WebSearch, StepType::NewsSearch, StepType::KbQuery]
                .into_iter()
                .collect(),
        }
    }
}

/// Clarification dialogue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClarificationConfig {
    /// Rounds before lenient defaults take over
    pub max_rounds: u32,
    /// Lenient defaults
    pub lenient: LenientDefaults,
}

impl Default for ClarificationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            lenient: LenientDefaults::default(),
        }
    }
}

/// Substitutions applied when clarification rounds run out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LenientDefaults {
    /// How many entities an unqualified "major ..." resolves to
    pub top_n: usize,
    /// Caller-supplied ranking signal for choosing them
    pub ranking_signal: String,
    /// Period an unqualified time reference resolves to
    pub recent_period: String,
}

impl Default for LenientDefaults {
    fn default() -> Self {
        Self {
            top_n: 5,
            ranking_signal: "market capitalization".to_string(),
            recent_period: "the most recent reporting period".to_string(),
        }
    }
}

/// Long-form stage settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Token budget for the summary stage
    pub summary_tokens: u32,
    /// Token budget for the body stage
    pub body_tokens: u32,
    /// Token budget for the conclusion stage
    pub conclusion_tokens: u32,
    /// Wall-clock ceiling per stage call
    pub stage_timeout_secs: u64,
    /// Budget multiplier for the single retry
    pub retry_budget_ratio: f64,
}

impl StageConfig {
    /// Stage timeout as a duration
    #[inline]
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            summary_tokens: 1024,
            body_tokens: 3072,
            conclusion_tokens: 1024,
            stage_timeout_secs: 10,
            retry_budget_ratio: 0.5,
        }
    }
}

/// Plan validation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlanConfig {
    /// Step cap per tier; may only tighten the defaults
    pub caps: TierCaps,
}

/// Conversation context settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Prior turns rendered into seed text
    pub window_turns: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { window_turns: 2 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.early_termination.threshold_chars, 800);
        assert_eq!(config.clarification.max_rounds, 3);
        assert_eq!(config.plan.caps.complex, 15);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [scheduler]
            max_concurrency = 2

            [early_termination]
            threshold_chars = 500
            trigger_types = ["AGGREGATE"]
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.scheduler.step_timeout_secs, 60);
        assert_eq!(config.early_termination.threshold_chars, 500);
        assert_eq!(config.early_termination.trigger_types.len(), 1);
        assert_eq!(config.early_termination.gathering_types.len(), 3);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let err = OrchestratorConfig::from_toml_str("[scheduler]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_overlapping_type_sets() {
        let err = OrchestratorConfig::from_toml_str(
            "[early_termination]\ntrigger_types = [\"AGGREGATE\"]\ngathering_types = [\"AGGREGATE\"]\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn rejects_bad_ratio_and_caps() {
        let err = OrchestratorConfig::from_toml_str("[stages]\nretry_budget_ratio = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = OrchestratorConfig::from_toml_str(
            "[plan.caps]\nsimple = 8\nmedium = 4\ncomplex = 15\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = OrchestratorConfig::from_toml_str("[plan.caps]\ncomplex = 20\n").unwrap_err();
        assert!(err.to_string().contains("tighten"));

        let tight = OrchestratorConfig::from_toml_str("[plan.caps]\nsimple = 3\n").unwrap();
        assert_eq!(tight.plan.caps.cap(delve_plan::ComplexityTier::Simple), 3);
    }

    #[test]
    fn rejects_unknown_step_type_names() {
        let err = OrchestratorConfig::from_toml_str(
            "[early_termination]\ntrigger_types = [\"SUMMARIZE\"]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}

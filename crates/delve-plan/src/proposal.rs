//! Planner proposals
//!
//! A proposal is the unvalidated step list produced by an external planning
//! capability. Planner replies are free text that usually wrap a JSON object
//! in a fenced code block.

use crate::error::ProposalError;
use serde::{Deserialize, Serialize};

/// A step as proposed by the planner, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedStep {
    /// Proposed id; assigned from position when absent
    #[serde(default)]
    pub step_id: Option<u32>,
    /// Step type as text
    pub step_type: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Query or instruction
    pub action: String,
    /// Ids of steps that must complete first
    #[serde(default)]
    pub dependencies: Vec<u32>,
    /// Expected output
    #[serde(default)]
    pub expected_output: String,
}

impl ProposedStep {
    /// Create a proposed step without an explicit id
    #[inline]
    #[must_use]
    pub fn new(step_type: impl Into<String>, action: impl Into<String>) -> Self {
        let action = action.into();
        Self {
            step_id: None,
            step_type: step_type.into(),
            description: action.clone(),
            action,
            dependencies: Vec::new(),
            expected_output: String::new(),
        }
    }

    /// With explicit id
    #[inline]
    #[must_use]
    pub fn with_id(mut self, id: u32) -> Self {
        self.step_id = Some(id);
        self
    }

    /// Add a dependency
    #[inline]
    #[must_use]
    pub fn depends_on(mut self, id: u32) -> Self {
        self.dependencies.push(id);
        self
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Planner output: a proposed plan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanProposal {
    /// Question as the planner understood it
    #[serde(default)]
    pub question: String,
    /// Planner's analysis
    #[serde(default)]
    pub analysis: String,
    /// Proposed steps in submission order
    pub steps: Vec<ProposedStep>,
    /// Description of the final answer
    #[serde(default)]
    pub expected_final_output: String,
    /// Declared complexity (`simple`, `medium`, `complex`)
    #[serde(default)]
    pub complexity: Option<String>,
}

impl PlanProposal {
    /// Create a proposal from steps
    #[inline]
    #[must_use]
    pub fn new(steps: Vec<ProposedStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// With declared complexity
    #[inline]
    #[must_use]
    pub fn with_complexity(mut self, complexity: impl Into<String>) -> Self {
        self.complexity = Some(complexity.into());
        self
    }

    /// With analysis
    #[inline]
    #[must_use]
    pub fn with_analysis(mut self, analysis: impl Into<String>) -> Self {
        self.analysis = analysis.into();
        self
    }

    /// Parse a JSON proposal
    ///
    /// # Errors
    /// `ProposalError::Json` if the text is not a valid proposal
    pub fn from_json(json: &str) -> Result<Self, ProposalError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a free-text planner reply
    ///
    /// Looks for a ```json fenced block, then any fenced block, then the
    /// outermost `{ ... }` span of the raw text.
    ///
    /// # Errors
    /// - `ProposalError::NoJson` if no JSON object is present
    /// - `ProposalError::Json` if the object does not match the schema
    pub fn from_planner_text(text: &str) -> Result<Self, ProposalError> {
        let json = extract_json(text).ok_or(ProposalError::NoJson)?;
        Self::from_json(json)
    }
}

fn extract_json(text: &str) -> Option<&str> {
    if let Some(body) = fenced(text, "```json") {
        return Some(body);
    }
    if let Some(body) = fenced(text, "```") {
        return Some(body);
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn fenced<'a>(text: &'a str, opener: &str) -> Option<&'a str> {
    let start = text.find(opener)? + opener.len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

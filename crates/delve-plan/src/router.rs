//! Step routing
//!
//! A static, data-driven table from step type to capability class. Callers
//! never branch on step type themselves.

use crate::error::RoutingError;
use crate::types::StepType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Capability class a step is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Web and news search, plus free reasoning
    WebSearch,
    /// Knowledge base retrieval
    Knowledge,
    /// Aggregation and comparison
    Synthesis,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::WebSearch => "web_search",
            CapabilityKind::Knowledge => "knowledge",
            CapabilityKind::Synthesis => "synthesis",
        };
        f.write_str(name)
    }
}

/// Step type to capability table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRouter {
    table: BTreeMap<StepType, CapabilityKind>,
}

impl StepRouter {
    /// Router with the standard table
    #[must_use]
    pub fn new() -> Self {
        Self::empty()
            .with_route(StepType::Reasoning, CapabilityKind::WebSearch)
            .with_route(StepType::WebSearch, CapabilityKind::WebSearch)
            .with_route(StepType::NewsSearch, CapabilityKind::WebSearch)
            .with_route(StepType::KbQuery, CapabilityKind::Knowledge)
            .with_route(StepType::Aggregate, CapabilityKind::Synthesis)
            .with_route(StepType::Compare, CapabilityKind::Synthesis)
    }

    /// Router with no routes
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self {
            table: BTreeMap::new(),
        }
    }

    /// With a route (replaces any existing route for the type)
    #[inline]
    #[must_use]
    pub fn with_route(mut self, step_type: StepType, kind: CapabilityKind) -> Self {
        self.table.insert(step_type, kind);
        self
    }

    /// Without a route
    #[inline]
    #[must_use]
    pub fn without_route(mut self, step_type: StepType) -> Self {
        self.table.remove(&step_type);
        self
    }

    /// Resolve the capability for a step type
    ///
    /// # Errors
    /// `RoutingError` if the type is unmapped
    #[inline]
    pub fn route(&self, step_type: StepType) -> Result<CapabilityKind, RoutingError> {
        self.table
            .get(&step_type)
            .copied()
            .ok_or(RoutingError { step_type })
    }

    /// All routes in step-type order
    pub fn routes(&self) -> impl Iterator<Item = (StepType, CapabilityKind)> + '_ {
        self.table.iter().map(|(t, k)| (*t, *k))
    }
}

impl Default for StepRouter {
    fn default() -> Self {
        Self::new()
    }
}

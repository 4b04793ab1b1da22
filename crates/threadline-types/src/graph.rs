//! Workflow graph definition types.
//!
//! A `WorkflowGraph` is the declarative description of a conversation:
//! steps bound to named functions and transitions between them. Graphs are
//! immutable once loaded; the engine only reads them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A node of the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique step identifier (referenced by transitions and `@{id}` expressions).
    pub id: String,
    /// Function locator in `module.function` form (e.g. `request.request`).
    pub function: String,
    /// Parameter name -> literal or reference template. Nested objects and
    /// arrays are resolved recursively.
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a transition combines its conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl Default for ConditionOperator {
    fn default() -> Self {
        ConditionOperator::And
    }
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionOperator::And => write!(f, "AND"),
            ConditionOperator::Or => write!(f, "OR"),
        }
    }
}

impl std::str::FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AND" => Ok(ConditionOperator::And),
            "OR" => Ok(ConditionOperator::Or),
            other => Err(format!("invalid condition operator: '{other}'")),
        }
    }
}

/// A directed, optionally conditional edge between two steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Reference expressions, optionally with a comparison
    /// (`@{check}.result`, `@{score}.value > 3`). Empty means unconditional.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub operator: ConditionOperator,
}

impl TransitionDefinition {
    pub fn is_unconditional(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// A complete workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step every new session starts from.
    pub root: String,
    pub steps: Vec<StepDefinition>,
    /// Declaration order is the evaluation order for transitions sharing a source.
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
}

impl WorkflowGraph {
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Outgoing transitions of `source` in declaration order.
    pub fn outgoing(&self, source: &str) -> impl Iterator<Item = &TransitionDefinition> {
        self.transitions.iter().filter(move |t| t.source == source)
    }
}

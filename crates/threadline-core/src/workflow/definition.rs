//! Workflow graph parsing, validation, and file loading.
//!
//! Converts YAML or JSON documents into the `WorkflowGraph` IR and checks
//! structural constraints (unique ids, known endpoints, parseable
//! expressions, known function locators).

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;
use thiserror::Error;
use threadline_types::graph::WorkflowGraph;

use super::reference::{needs_parsing, parse_expression};
use super::registry::FunctionRegistry;
use super::transition::Condition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GraphError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A transition or the root names a step that does not exist.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A step is bound to a locator the registry cannot resolve.
    #[error("unknown function '{function}' for step '{step_id}'")]
    UnknownFunction { step_id: String, function: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a structurally valid graph.
pub fn parse_graph_yaml(yaml: &str) -> Result<WorkflowGraph, GraphError> {
    let graph: WorkflowGraph =
        serde_yaml_ng::from_str(yaml).map_err(|e| GraphError::ParseError(e.to_string()))?;
    validate_graph(&graph, None)?;
    Ok(graph)
}

/// Parse a JSON document into a structurally valid graph.
pub fn parse_graph_json(json: &str) -> Result<WorkflowGraph, GraphError> {
    let graph: WorkflowGraph =
        serde_json::from_str(json).map_err(|e| GraphError::ParseError(e.to_string()))?;
    validate_graph(&graph, None)?;
    Ok(graph)
}

/// Serialize a graph to YAML.
pub fn serialize_graph_yaml(graph: &WorkflowGraph) -> Result<String, GraphError> {
    serde_yaml_ng::to_string(graph).map_err(|e| GraphError::ParseError(e.to_string()))
}

/// Load a graph file. `.json` files are read as JSON, everything else as YAML.
pub fn load_graph_file(path: &Path) -> Result<WorkflowGraph, GraphError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        parse_graph_json(&content)
    } else {
        parse_graph_yaml(&content)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a graph.
///
/// Checks:
/// - Name is non-empty and at least one step exists
/// - Step ids and transition ids are unique
/// - The root and every transition endpoint name an existing step
/// - Every transition condition and every input expression parses
/// - Every function locator is registered (only when `registry` is given)
pub fn validate_graph(
    graph: &WorkflowGraph,
    registry: Option<&FunctionRegistry>,
) -> Result<(), GraphError> {
    if graph.name.trim().is_empty() {
        return Err(GraphError::ValidationError(
            "graph name must not be empty".to_string(),
        ));
    }
    if graph.steps.is_empty() {
        return Err(GraphError::ValidationError(
            "graph must have at least one step".to_string(),
        ));
    }

    let mut step_ids = HashSet::new();
    for step in &graph.steps {
        if step.id.trim().is_empty() {
            return Err(GraphError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if !step_ids.insert(step.id.as_str()) {
            return Err(GraphError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    if !step_ids.contains(graph.root.as_str()) {
        return Err(GraphError::UnknownStep(format!(
            "root '{}' is not a step",
            graph.root
        )));
    }

    let mut transition_ids = HashSet::new();
    for transition in &graph.transitions {
        if !transition_ids.insert(transition.id.as_str()) {
            return Err(GraphError::ValidationError(format!(
                "duplicate transition ID: '{}'",
                transition.id
            )));
        }
        for endpoint in [&transition.source, &transition.target] {
            if !step_ids.contains(endpoint.as_str()) {
                return Err(GraphError::UnknownStep(format!(
                    "transition '{}' references unknown step '{}'",
                    transition.id, endpoint
                )));
            }
        }
        for condition in &transition.conditions {
            Condition::parse(condition).map_err(|e| {
                GraphError::ValidationError(format!(
                    "transition '{}' condition '{}': {e}",
                    transition.id, condition
                ))
            })?;
        }
    }

    for step in &graph.steps {
        for (name, value) in &step.input {
            check_input(value).map_err(|reason| {
                GraphError::ValidationError(format!(
                    "step '{}' input '{}': {reason}",
                    step.id, name
                ))
            })?;
        }
        if let Some(registry) = registry {
            if !registry.contains(&step.function) {
                return Err(GraphError::UnknownFunction {
                    step_id: step.id.clone(),
                    function: step.function.clone(),
                });
            }
        }
    }

    Ok(())
}

fn check_input(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) if needs_parsing(s) => {
            parse_expression(s).map(|_| ()).map_err(|e| e.to_string())
        }
        Value::Array(items) => items.iter().try_for_each(check_input),
        Value::Object(map) => map.values().try_for_each(check_input),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

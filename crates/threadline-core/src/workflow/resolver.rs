//! Variable resolution against a session's recorded step outputs.
//!
//! `VariableResolver` turns parsed references into values:
//! - `memory[step]` is looked up at the requested cycle (newest by default)
//! - the path is walked through objects, arrays and JSON-encoded strings
//! - the default is used only when the path is absent
//!
//! A reference that cannot be resolved and has no usable default is
//! *unresolved*, which is a normal outcome rather than an error.

use std::collections::HashSet;

use serde_json::{Map, Value};
use threadline_types::session::Session;

use super::reference::{
    DefaultValue, PathSegment, Template, TemplatePart, VariableRef, needs_parsing,
    parse_expression,
};
use super::value::value_to_string;

/// Result of resolving an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The value, when every reference resolved.
    pub value: Option<Value>,
    /// Canonical spellings of the references that did not resolve.
    pub missing: Vec<String>,
}

impl Resolution {
    fn resolved(value: Value) -> Self {
        Self {
            value: Some(value),
            missing: Vec::new(),
        }
    }

    fn unresolved(missing: Vec<String>) -> Self {
        Self {
            value: None,
            missing,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }
}

/// Resolves references against one session's memory.
pub struct VariableResolver<'a> {
    session: &'a Session,
}

impl<'a> VariableResolver<'a> {
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Resolve an expression to `(value, ok)`.
    ///
    /// `ok` is false only when some reference is absent and has no default;
    /// the value is then `Null`.
    pub fn resolve(&self, expression: &str) -> (Value, bool) {
        match self.resolve_expression(expression).value {
            Some(value) => (value, true),
            None => (Value::Null, false),
        }
    }

    /// Resolve an expression, reporting which references were missing.
    ///
    /// Expressions that fail to parse are unresolved, listed verbatim.
    pub fn resolve_expression(&self, expression: &str) -> Resolution {
        match parse_expression(expression) {
            Ok(template) => self.resolve_template(&template),
            Err(e) => {
                tracing::debug!(expression, error = %e, "unparseable reference expression");
                Resolution::unresolved(vec![expression.to_string()])
            }
        }
    }

    /// Resolve a parsed template.
    ///
    /// A template that is exactly one reference yields the typed value;
    /// otherwise every reference is rendered into the surrounding text.
    pub fn resolve_template(&self, template: &Template) -> Resolution {
        if let Some(reference) = template.single_reference() {
            return match self.resolve_reference(reference) {
                Some(value) => Resolution::resolved(value),
                None => Resolution::unresolved(vec![reference.to_string()]),
            };
        }

        let mut rendered = String::new();
        let mut missing = Vec::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => rendered.push_str(text),
                TemplatePart::Reference(reference) => match self.resolve_reference(reference) {
                    Some(value) => rendered.push_str(&value_to_string(&value)),
                    None => missing.push(reference.to_string()),
                },
            }
        }

        if missing.is_empty() {
            Resolution::resolved(Value::String(rendered))
        } else {
            Resolution::unresolved(missing)
        }
    }

    /// Resolve a single reference, falling back to its default.
    pub fn resolve_reference(&self, reference: &VariableRef) -> Option<Value> {
        let record = match reference.cycle {
            Some(cycle) => self.session.output_at(&reference.step_id, cycle),
            None => self.session.latest_output(&reference.step_id),
        };

        if let Some(value) = record.and_then(|r| lookup_path(&r.value, &reference.path)) {
            return Some(value);
        }

        match &reference.default {
            Some(DefaultValue::Literal(value)) => Some(value.clone()),
            Some(DefaultValue::Reference(inner)) => self.resolve_reference(inner),
            None => None,
        }
    }

    /// Resolve a step's input template.
    ///
    /// Strings are resolved as expressions; objects and arrays are walked
    /// recursively. Returns every missing reference when anything is
    /// unresolved.
    pub fn resolve_inputs(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, Vec<String>> {
        let mut missing = Vec::new();
        let mut resolved = Map::with_capacity(inputs.len());
        for (name, template) in inputs {
            resolved.insert(name.clone(), self.resolve_value(template, &mut missing));
        }

        if missing.is_empty() {
            Ok(resolved)
        } else {
            let mut seen = HashSet::new();
            missing.retain(|reference| seen.insert(reference.clone()));
            Err(missing)
        }
    }

    fn resolve_value(&self, value: &Value, missing: &mut Vec<String>) -> Value {
        match value {
            Value::String(s) if needs_parsing(s) => {
                let resolution = self.resolve_expression(s);
                missing.extend(resolution.missing);
                resolution.value.unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, missing))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, missing)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// Walk `path` into `value`. Absent keys, out-of-range indexes and
/// traversal through scalars yield `None`.
pub fn lookup_path(value: &Value, path: &[PathSegment]) -> Option<Value> {
    let Some((segment, rest)) = path.split_first() else {
        return Some(value.clone());
    };

    let next = match (value, segment) {
        (Value::Object(map), PathSegment::Key(key)) => map.get(key)?,
        (Value::Array(items), PathSegment::Index(index)) => items.get(*index)?,
        (Value::Array(items), PathSegment::Key(key)) => items.get(key.parse::<usize>().ok()?)?,
        // Functions sometimes return structured data as a JSON string.
        (Value::String(s), _) => {
            let parsed: Value = serde_json::from_str(s).ok()?;
            if !(parsed.is_object() || parsed.is_array()) {
                return None;
            }
            return lookup_path(&parsed, path);
        }
        _ => return None,
    };
    lookup_path(next, rest)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

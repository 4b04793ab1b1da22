//! Transition condition evaluation.
//!
//! A transition fires when its source step completes and its conditions
//! hold. Each condition is a reference, optionally compared against a
//! literal:
//!
//! ```text
//! @{check}.result
//! @{score}.value|0 >= 3
//! @{sentiment}.label == "positive"
//! @{extract}.tags contains urgent
//! ```
//!
//! Combining rules:
//! - `AND`: an unresolved condition counts as false.
//! - `OR`: unresolved conditions are left out; at least one resolved
//!   condition must hold, so a transition whose conditions are all
//!   unresolved does not fire.
//!
//! A condition that fails to parse is treated as unresolved, never as a
//! fatal error.

use serde_json::Value;
use threadline_types::graph::{ConditionOperator, TransitionDefinition};
use threadline_types::session::Session;

use super::reference::{ReferenceError, VariableRef, parse_literal, parse_reference_prefix};
use super::resolver::VariableResolver;
use super::value::{contains, is_truthy, loose_cmp, loose_eq, normalize};

// ---------------------------------------------------------------------------
// Condition AST
// ---------------------------------------------------------------------------

/// Comparison applied to a condition's resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl CompareOp {
    /// Longest tokens first so `>=` is not read as `>`.
    const TOKENS: [(&'static str, CompareOp); 7] = [
        ("==", CompareOp::Eq),
        ("!=", CompareOp::Ne),
        (">=", CompareOp::Ge),
        ("<=", CompareOp::Le),
        (">", CompareOp::Gt),
        ("<", CompareOp::Lt),
        ("contains", CompareOp::Contains),
    ];

    pub fn apply(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;
        match self {
            CompareOp::Eq => loose_eq(left, right),
            CompareOp::Ne => !loose_eq(left, right),
            CompareOp::Gt => loose_cmp(left, right) == Some(Ordering::Greater),
            CompareOp::Ge => matches!(
                loose_cmp(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CompareOp::Lt => loose_cmp(left, right) == Some(Ordering::Less),
            CompareOp::Le => matches!(
                loose_cmp(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ),
            CompareOp::Contains => contains(left, right),
        }
    }
}

/// A parsed transition condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// A literal such as `true`; always resolved.
    Constant(Value),
    /// A reference, optionally compared against a literal.
    Reference {
        reference: VariableRef,
        comparison: Option<(CompareOp, Value)>,
    },
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        let trimmed = input.trim();
        if !trimmed.starts_with("@{") {
            return Ok(Condition::Constant(parse_literal(trimmed)));
        }

        let (reference, rest) = parse_reference_prefix(trimmed)?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(Condition::Reference {
                reference,
                comparison: None,
            });
        }

        let (op, operand) = CompareOp::TOKENS
            .iter()
            .find_map(|(token, op)| rest.strip_prefix(*token).map(|operand| (*op, operand)))
            .ok_or_else(|| ReferenceError::TrailingText(rest.to_string()))?;

        Ok(Condition::Reference {
            reference,
            comparison: Some((op, parse_operand(operand.trim()))),
        })
    }

    /// Evaluate against a session. `None` means the condition is unresolved.
    pub fn evaluate(&self, session: &Session) -> Option<bool> {
        match self {
            Condition::Constant(value) => Some(is_truthy(&normalize(value.clone()))),
            Condition::Reference {
                reference,
                comparison,
            } => {
                let value = VariableResolver::new(session).resolve_reference(reference)?;
                Some(match comparison {
                    None => is_truthy(&normalize(value)),
                    Some((op, operand)) => op.apply(&normalize(value), operand),
                })
            }
        }
    }
}

fn parse_operand(text: &str) -> Value {
    if text.starts_with('"') {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            return value;
        }
    }
    normalize(parse_literal(text))
}

// ---------------------------------------------------------------------------
// TransitionEvaluator
// ---------------------------------------------------------------------------

/// Detailed result of evaluating one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub fired: bool,
    /// Conditions that resolved truthy.
    pub held: usize,
    /// Conditions that resolved falsy.
    pub failed: usize,
    /// Conditions that did not resolve (or did not parse).
    pub unresolved: Vec<String>,
}

/// Decides which transitions fire.
#[derive(Debug, Clone, Default)]
pub struct TransitionEvaluator;

impl TransitionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, transition: &TransitionDefinition, session: &Session) -> bool {
        self.evaluate_detailed(transition, session).fired
    }

    pub fn evaluate_detailed(
        &self,
        transition: &TransitionDefinition,
        session: &Session,
    ) -> TransitionOutcome {
        let mut outcome = TransitionOutcome::default();
        if transition.is_unconditional() {
            outcome.fired = true;
            return outcome;
        }

        for expression in &transition.conditions {
            let result = match Condition::parse(expression) {
                Ok(condition) => condition.evaluate(session),
                Err(e) => {
                    tracing::warn!(
                        transition_id = transition.id.as_str(),
                        expression = expression.as_str(),
                        error = %e,
                        "condition failed to parse; treating as unresolved"
                    );
                    None
                }
            };
            match result {
                Some(true) => outcome.held += 1,
                Some(false) => outcome.failed += 1,
                None => outcome.unresolved.push(expression.clone()),
            }
        }

        outcome.fired = match transition.operator {
            ConditionOperator::And => outcome.failed == 0 && outcome.unresolved.is_empty(),
            ConditionOperator::Or => outcome.held > 0,
        };
        outcome
    }

    /// Targets of every firing transition, in declaration order, without
    /// duplicates.
    pub fn fired_targets(&self, transitions: &[TransitionDefinition], session: &Session) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for transition in transitions {
            let outcome = self.evaluate_detailed(transition, session);
            tracing::debug!(
                session_id = session.id.as_str(),
                transition_id = transition.id.as_str(),
                fired = outcome.fired,
                unresolved = outcome.unresolved.len(),
                "evaluated transition"
            );
            if outcome.fired && !targets.contains(&transition.target) {
                targets.push(transition.target.clone());
            }
        }
        targets
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transition(conditions: &[&str], operator: ConditionOperator) -> TransitionDefinition {
        TransitionDefinition {
            id: "t".to_string(),
            source: "a".to_string(),
            target: "b".to_string(),
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            operator,
        }
    }

    fn session() -> Session {
        let mut session = Session::new("s1", "root");
        session.append_output(
            "check",
            json!({"yes": true, "no": false, "text_yes": "true", "text_no": "False", "score": 4, "label": "positive", "tags": ["urgent", "billing"]}),
            1,
        );
        session
    }

    #[test]
    fn test_unconditional_fires() {
        let evaluator = TransitionEvaluator::new();
        assert!(evaluator.evaluate(&transition(&[], ConditionOperator::And), &session()));
    }

    #[test]
    fn test_and_with_unresolved_operand_never_fires() {
        let evaluator = TransitionEvaluator::new();
        let t = transition(&["@{check}.yes", "@{pending}.flag"], ConditionOperator::And);
        let outcome = evaluator.evaluate_detailed(&t, &session());
        assert!(!outcome.fired);
        assert_eq!(outcome.held, 1);
        assert_eq!(outcome.unresolved, vec!["@{pending}.flag".to_string()]);
    }

    #[test]
    fn test_or_with_unresolved_operand_fires_on_other_true() {
        let evaluator = TransitionEvaluator::new();
        let t = transition(&["@{check}.yes", "@{pending}.flag"], ConditionOperator::Or);
        assert!(evaluator.evaluate(&t, &session()));

        let t = transition(&["@{check}.no", "@{pending}.flag"], ConditionOperator::Or);
        assert!(!evaluator.evaluate(&t, &session()));
    }

    #[test]
    fn test_or_with_all_operands_unresolved_does_not_fire() {
        let evaluator = TransitionEvaluator::new();
        let t = transition(&["@{x}.a", "@{y}.b"], ConditionOperator::Or);
        assert!(!evaluator.evaluate(&t, &session()));
    }

    #[test]
    fn test_and_requires_every_operand() {
        let evaluator = TransitionEvaluator::new();
        assert!(evaluator.evaluate(
            &transition(&["@{check}.yes", "@{check}.text_yes"], ConditionOperator::And),
            &session()
        ));
        assert!(!evaluator.evaluate(
            &transition(&["@{check}.yes", "@{check}.no"], ConditionOperator::And),
            &session()
        ));
    }

    #[test]
    fn test_boolean_strings_are_normalized() {
        let evaluator = TransitionEvaluator::new();
        assert!(evaluator.evaluate(&transition(&["@{check}.text_yes"], ConditionOperator::And), &session()));
        assert!(!evaluator.evaluate(&transition(&["@{check}.text_no"], ConditionOperator::And), &session()));
        assert!(evaluator.evaluate(
            &transition(&["@{check}.text_yes == true"], ConditionOperator::And),
            &session()
        ));
    }

    #[test]
    fn test_default_typed_for_conditions() {
        let evaluator = TransitionEvaluator::new();
        assert!(!evaluator.evaluate(
            &transition(&["@{missing}.flag|false"], ConditionOperator::And),
            &session()
        ));
        assert!(evaluator.evaluate(
            &transition(&["@{missing}.flag|true"], ConditionOperator::And),
            &session()
        ));
    }

    #[test]
    fn test_comparisons() {
        let evaluator = TransitionEvaluator::new();
        let fires = |expr: &str| {
            evaluator.evaluate(&transition(&[expr], ConditionOperator::And), &session())
        };
        assert!(fires("@{check}.score > 3"));
        assert!(fires("@{check}.score >= 4"));
        assert!(!fires("@{check}.score < 4"));
        assert!(fires("@{check}.score <= 4"));
        assert!(fires("@{check}.label == \"positive\""));
        assert!(fires("@{check}.label == positive"));
        assert!(fires("@{check}.label != negative"));
        assert!(fires("@{check}.tags contains urgent"));
        assert!(!fires("@{check}.tags contains refund"));
        assert!(fires("@{missing}.score|0 < 1"));
    }

    #[test]
    fn test_parse_error_counts_as_unresolved() {
        let evaluator = TransitionEvaluator::new();
        let t = transition(&["@{check}.yes ~= 3", "@{check}.yes"], ConditionOperator::Or);
        let outcome = evaluator.evaluate_detailed(&t, &session());
        assert!(outcome.fired);
        assert_eq!(outcome.unresolved.len(), 1);

        let t = transition(&["@{broken", "@{check}.yes"], ConditionOperator::And);
        assert!(!evaluator.evaluate(&t, &session()));
    }

    #[test]
    fn test_constant_conditions() {
        let evaluator = TransitionEvaluator::new();
        assert!(evaluator.evaluate(&transition(&["true"], ConditionOperator::And), &session()));
        assert!(!evaluator.evaluate(&transition(&["false"], ConditionOperator::And), &session()));
    }

    #[test]
    fn test_fired_targets_all_matches_in_order() {
        let evaluator = TransitionEvaluator::new();
        let mk = |id: &str, target: &str, conditions: &[&str]| TransitionDefinition {
            id: id.to_string(),
            source: "check".to_string(),
            target: target.to_string(),
            conditions: conditions.iter().map(|c| c.to_string()).collect(),
            operator: ConditionOperator::And,
        };
        let transitions = vec![
            mk("t1", "positive_path", &["@{check}.label == positive"]),
            mk("t2", "negative_path", &["@{check}.label == negative"]),
            mk("t3", "audit", &[]),
            mk("t4", "positive_path", &[]),
        ];
        assert_eq!(
            evaluator.fired_targets(&transitions, &session()),
            vec!["positive_path".to_string(), "audit".to_string()]
        );
    }
}

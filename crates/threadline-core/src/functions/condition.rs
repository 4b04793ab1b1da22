//! `condition.*`: comparison helpers producing `{"result": bool}`.
//!
//! Operands are read from `left`/`value` and `right`/`expected`. Transitions
//! typically test `@{check}.result`.

use serde_json::{Map, Value, json};

use crate::workflow::function::{FunctionError, FunctionKind};
use crate::workflow::registry::FunctionRegistry;
use crate::workflow::value::{contains, is_truthy, loose_cmp, loose_eq, normalize};

fn operand(inputs: &Map<String, Value>, names: &[&str]) -> Result<Value, FunctionError> {
    names
        .iter()
        .find_map(|name| inputs.get(*name))
        .cloned()
        .ok_or_else(|| FunctionError::missing_input(names[0]))
}

fn operands(inputs: &Map<String, Value>) -> Result<(Value, Value), FunctionError> {
    Ok((
        operand(inputs, &["left", "value"])?,
        operand(inputs, &["right", "expected"])?,
    ))
}

fn result(value: bool) -> Value {
    json!({ "result": value })
}

pub fn register(registry: &mut FunctionRegistry) {
    registry
        .register_fn("condition.equals", FunctionKind::Normal, |_, inputs| {
            let (left, right) = operands(&inputs)?;
            Ok(result(loose_eq(&left, &right)))
        })
        .register_fn("condition.not_equals", FunctionKind::Normal, |_, inputs| {
            let (left, right) = operands(&inputs)?;
            Ok(result(!loose_eq(&left, &right)))
        })
        .register_fn("condition.contains", FunctionKind::Normal, |_, inputs| {
            let (left, right) = operands(&inputs)?;
            Ok(result(contains(&left, &right)))
        })
        .register_fn("condition.greater_than", FunctionKind::Normal, |_, inputs| {
            let (left, right) = operands(&inputs)?;
            Ok(result(loose_cmp(&left, &right) == Some(std::cmp::Ordering::Greater)))
        })
        .register_fn("condition.less_than", FunctionKind::Normal, |_, inputs| {
            let (left, right) = operands(&inputs)?;
            Ok(result(loose_cmp(&left, &right) == Some(std::cmp::Ordering::Less)))
        })
        // A lone `value` is tested for truthiness; no input means "always".
        .register_fn("condition.true", FunctionKind::Normal, |_, inputs| {
            let truth = inputs
                .get("value")
                .map(|v| is_truthy(&normalize(v.clone())))
                .unwrap_or(true);
            Ok(result(truth))
        });
}

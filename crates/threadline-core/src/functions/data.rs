//! `data.set`: store its resolved inputs as the step output.

use serde_json::{Map, Value};

use crate::workflow::function::{FunctionError, SessionView, StepFunction};

pub const LOCATOR: &str = "data.set";

pub struct SetData;

impl StepFunction for SetData {
    async fn call(
        &self,
        _view: &SessionView,
        inputs: Map<String, Value>,
    ) -> Result<Value, FunctionError> {
        Ok(Value::Object(inputs))
    }
}

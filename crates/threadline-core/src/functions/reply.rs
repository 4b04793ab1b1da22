//! `reply.reply`: emit user-visible text without pausing.

use serde_json::{Map, Value, json};

use crate::workflow::function::{FunctionError, FunctionKind, SessionView, StepFunction, string_input};

pub const LOCATOR: &str = "reply.reply";

pub struct EmitReply;

impl StepFunction for EmitReply {
    fn kind(&self) -> FunctionKind {
        FunctionKind::ReplyEmission
    }

    async fn call(
        &self,
        _view: &SessionView,
        inputs: Map<String, Value>,
    ) -> Result<Value, FunctionError> {
        let reply = string_input(&inputs, &["reply", "response", "text"])
            .ok_or_else(|| FunctionError::missing_input("reply"))?;
        Ok(json!({ "reply": reply }))
    }
}

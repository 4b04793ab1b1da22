//! `request.request`: ask the human a question and pause the session.

use serde_json::{Map, Value, json};

use crate::workflow::function::{FunctionError, FunctionKind, SessionView, StepFunction, string_input};

pub const LOCATOR: &str = "request.request";

/// Produces the prompt shown to the human. The engine pauses after it runs.
pub struct RequestInput;

impl StepFunction for RequestInput {
    fn kind(&self) -> FunctionKind {
        FunctionKind::InputRequest
    }

    async fn call(
        &self,
        _view: &SessionView,
        inputs: Map<String, Value>,
    ) -> Result<Value, FunctionError> {
        let statement = string_input(&inputs, &["statement", "query", "prompt"])
            .ok_or_else(|| FunctionError::missing_input("statement"))?;
        Ok(json!({ "statement": statement }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_types::session::Session;

    #[tokio::test]
    async fn test_request_returns_statement() {
        let view = SessionView::new(Session::new("s1", "ask"));
        let inputs = json!({"query": "Name?"}).as_object().unwrap().clone();
        let output = RequestInput.call(&view, inputs).await.unwrap();
        assert_eq!(output, json!({"statement": "Name?"}));
    }

    #[tokio::test]
    async fn test_request_without_statement_fails() {
        let view = SessionView::new(Session::new("s1", "ask"));
        let err = RequestInput.call(&view, Map::new()).await.unwrap_err();
        assert!(!err.recoverable);
        assert!(err.message.contains("statement"));
    }
}

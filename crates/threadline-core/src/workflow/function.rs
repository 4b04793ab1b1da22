//! Step function contract.
//!
//! Every step is bound to a function by locator. Functions receive a
//! read-only [`SessionView`] and their resolved input map, and return an
//! output value or a [`FunctionError`].
//!
//! Follows the same blanket-impl pattern used for other pluggable
//! providers:
//! 1. `StepFunction` uses native async fn in traits (RPITIT)
//! 2. `StepFunctionDyn` is the object-safe version with boxed futures
//! 3. A blanket impl covers every `StepFunction`, so the registry can hold
//!    `Arc<dyn StepFunctionDyn>`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use threadline_types::session::{ChatMessage, OutputRecord, Session, SessionStatus};

use super::resolver::VariableResolver;

// ---------------------------------------------------------------------------
// FunctionKind / FunctionError
// ---------------------------------------------------------------------------

/// Behavioral kinds the engine special-cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Produces output; the session continues.
    Normal,
    /// Produces a prompt; the session pauses for human input.
    InputRequest,
    /// Produces user-visible text; no pause.
    ReplyEmission,
}

/// Failure returned by a step function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FunctionError {
    pub message: String,
    /// Recoverable failures are logged without failing the session.
    pub recoverable: bool,
}

impl FunctionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }

    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn missing_input(name: &str) -> Self {
        Self::new(format!("missing required input '{name}'"))
    }
}

// ---------------------------------------------------------------------------
// SessionView
// ---------------------------------------------------------------------------

/// Read-only, cheaply cloneable view of a session handed to step functions.
#[derive(Debug, Clone)]
pub struct SessionView {
    session: Arc<Session>,
}

impl SessionView {
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(session),
        }
    }

    pub fn id(&self) -> &str {
        &self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn pass(&self) -> u64 {
        self.session.pass
    }

    pub fn outputs(&self, step_id: &str) -> &[OutputRecord] {
        self.session.outputs(step_id)
    }

    pub fn latest_output(&self, step_id: &str) -> Option<&Value> {
        self.session.latest_output(step_id).map(|r| &r.value)
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.session.history
    }

    /// Resolve a reference expression against this view.
    pub fn resolve(&self, expression: &str) -> (Value, bool) {
        VariableResolver::new(&self.session).resolve(expression)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

// ---------------------------------------------------------------------------
// StepFunction
// ---------------------------------------------------------------------------

/// A callable a step can be bound to.
pub trait StepFunction: Send + Sync {
    fn kind(&self) -> FunctionKind {
        FunctionKind::Normal
    }

    fn call(
        &self,
        view: &SessionView,
        inputs: Map<String, Value>,
    ) -> impl Future<Output = Result<Value, FunctionError>> + Send;
}

/// Object-safe version of [`StepFunction`] with boxed futures.
pub trait StepFunctionDyn: Send + Sync {
    fn kind(&self) -> FunctionKind;

    fn call_boxed<'a>(
        &'a self,
        view: &'a SessionView,
        inputs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, FunctionError>> + Send + 'a>>;
}

/// Blanket implementation: any `StepFunction` automatically implements `StepFunctionDyn`.
impl<T: StepFunction> StepFunctionDyn for T {
    fn kind(&self) -> FunctionKind {
        StepFunction::kind(self)
    }

    fn call_boxed<'a>(
        &'a self,
        view: &'a SessionView,
        inputs: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Value, FunctionError>> + Send + 'a>> {
        Box::pin(self.call(view, inputs))
    }
}

/// Adapter turning a synchronous closure into a [`StepFunction`].
pub struct FnStep<F> {
    kind: FunctionKind,
    func: F,
}

impl<F> FnStep<F>
where
    F: Fn(&SessionView, Map<String, Value>) -> Result<Value, FunctionError> + Send + Sync,
{
    pub fn new(kind: FunctionKind, func: F) -> Self {
        Self { kind, func }
    }
}

impl<F> StepFunction for FnStep<F>
where
    F: Fn(&SessionView, Map<String, Value>) -> Result<Value, FunctionError> + Send + Sync,
{
    fn kind(&self) -> FunctionKind {
        self.kind
    }

    async fn call(
        &self,
        view: &SessionView,
        inputs: Map<String, Value>,
    ) -> Result<Value, FunctionError> {
        (self.func)(view, inputs)
    }
}

/// Read a string input, rendering non-string values.
pub fn string_input(inputs: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| inputs.get(*name))
        .filter(|value| !value.is_null())
        .map(super::value::value_to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl StepFunction for Echo {
        async fn call(
            &self,
            view: &SessionView,
            inputs: Map<String, Value>,
        ) -> Result<Value, FunctionError> {
            Ok(json!({ "session": view.id(), "inputs": inputs }))
        }
    }

    #[tokio::test]
    async fn test_blanket_dyn_impl_dispatches() {
        let func: Arc<dyn StepFunctionDyn> = Arc::new(Echo);
        let view = SessionView::new(Session::new("s1", "root"));
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(1));

        let output = func.call_boxed(&view, inputs).await.unwrap();
        assert_eq!(output, json!({"session": "s1", "inputs": {"x": 1}}));
        assert_eq!(func.kind(), FunctionKind::Normal);
    }

    #[tokio::test]
    async fn test_fn_step_adapter_keeps_kind() {
        let func: Arc<dyn StepFunctionDyn> = Arc::new(FnStep::new(
            FunctionKind::ReplyEmission,
            |_view, _inputs| Err(FunctionError::recoverable("try later")),
        ));
        let view = SessionView::new(Session::new("s1", "root"));
        let err = func.call_boxed(&view, Map::new()).await.unwrap_err();
        assert!(err.recoverable);
        assert_eq!(err.to_string(), "try later");
        assert_eq!(func.kind(), FunctionKind::ReplyEmission);
    }

    #[test]
    fn test_session_view_reads_memory() {
        let mut session = Session::new("s1", "root");
        session.append_output("ask", json!({"response": "Ava"}), 1);
        let view = SessionView::new(session);
        assert_eq!(view.latest_output("ask"), Some(&json!({"response": "Ava"})));
        assert_eq!(view.resolve("@{ask}.response"), (json!("Ava"), true));
        assert!(view.latest_output("nope").is_none());
    }

    #[test]
    fn test_string_input_lookup_order() {
        let inputs = json!({"query": "Name?", "count": 3}).as_object().unwrap().clone();
        assert_eq!(string_input(&inputs, &["statement", "query"]), Some("Name?".to_string()));
        assert_eq!(string_input(&inputs, &["count"]), Some("3".to_string()));
        assert_eq!(string_input(&inputs, &["missing"]), None);
    }
}

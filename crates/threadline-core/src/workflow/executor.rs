//! Step executor: resolves a step's inputs, calls its function and records
//! the result.
//!
//! Execution and recording are split so the engine can run a batch of steps
//! concurrently against a snapshot and then commit every outcome in
//! frontier order under the session lock.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use threadline_types::graph::StepDefinition;
use threadline_types::session::Session;

use super::function::{FunctionError, FunctionKind, SessionView};
use super::registry::FunctionRegistry;
use super::resolver::VariableResolver;

/// Default step-level timeout (60 seconds).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The function ran and produced `output`.
    Success { output: Value, kind: FunctionKind },
    /// Some input references did not resolve; the function was not called.
    Unresolved { missing: Vec<String> },
    /// The function (or its lookup) failed.
    Failed(FunctionError),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Runs individual steps against a session view.
#[derive(Debug, Clone)]
pub struct StepExecutor {
    registry: Arc<FunctionRegistry>,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            registry,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Kind of the function a step is bound to, if registered.
    pub fn kind_of(&self, step: &StepDefinition) -> Option<FunctionKind> {
        self.registry.kind_of(&step.function)
    }

    /// Attempt a step without touching the session.
    pub async fn execute(&self, step: &StepDefinition, view: &SessionView) -> StepOutcome {
        let Some(function) = self.registry.get(&step.function) else {
            return StepOutcome::Failed(FunctionError::new(format!(
                "unknown function '{}'",
                step.function
            )));
        };

        let inputs = match VariableResolver::new(view.session()).resolve_inputs(&step.input) {
            Ok(inputs) => inputs,
            Err(missing) => {
                tracing::debug!(
                    session_id = view.id(),
                    step_id = step.id.as_str(),
                    missing = ?missing,
                    "step inputs unresolved"
                );
                return StepOutcome::Unresolved { missing };
            }
        };

        let kind = function.kind();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.step_timeout, function.call_boxed(view, inputs)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                tracing::debug!(
                    session_id = view.id(),
                    step_id = step.id.as_str(),
                    function = step.function.as_str(),
                    elapsed_ms,
                    "step executed"
                );
                StepOutcome::Success { output, kind }
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    session_id = view.id(),
                    step_id = step.id.as_str(),
                    recoverable = err.recoverable,
                    error = %err,
                    "step function failed"
                );
                StepOutcome::Failed(err)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    session_id = view.id(),
                    step_id = step.id.as_str(),
                    timeout_secs = self.step_timeout.as_secs(),
                    "step timed out"
                );
                StepOutcome::Failed(FunctionError::new(format!(
                    "step timed out after {}s",
                    self.step_timeout.as_secs()
                )))
            }
        }
    }

    /// Apply an outcome to the session. Returns the new cycle index when an
    /// output was recorded.
    ///
    /// Unresolved outcomes leave the session untouched; the deferral
    /// manager owns that bookkeeping.
    pub fn record(&self, session: &mut Session, step_id: &str, outcome: &StepOutcome) -> Option<usize> {
        match outcome {
            StepOutcome::Success { output, .. } => {
                let pass = session.pass;
                Some(session.append_output(step_id, output.clone(), pass))
            }
            StepOutcome::Failed(err) => {
                session.record_error(step_id, err.message.clone(), err.recoverable);
                None
            }
            StepOutcome::Unresolved { .. } => None,
        }
    }

    /// Execute a step against the current session state and record the result.
    pub async fn execute_and_record(
        &self,
        session: &mut Session,
        step: &StepDefinition,
    ) -> (StepOutcome, Option<usize>) {
        let view = SessionView::new(session.clone());
        let outcome = self.execute(step, &view).await;
        let cycle = self.record(session, &step.id, &outcome);
        (outcome, cycle)
    }
}

//! Graph repository trait definition.
//!
//! Read-only view of a workflow graph: step definitions and their outgoing
//! transitions. The engine never writes back to the graph.

use threadline_types::error::RepositoryError;
use threadline_types::graph::{StepDefinition, TransitionDefinition};

/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait GraphRepository: Send + Sync {
    /// Step every new session starts from.
    fn root_step_id(
        &self,
    ) -> impl std::future::Future<Output = Result<String, RepositoryError>> + Send;

    /// Get a step definition by id.
    fn get_step(
        &self,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepDefinition>, RepositoryError>> + Send;

    /// Outgoing transitions of `source`, in declaration order.
    fn outgoing_transitions(
        &self,
        source: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TransitionDefinition>, RepositoryError>> + Send;
}

//! In-memory repositories.
//!
//! Used when no database is configured and in tests. Sessions live in a
//! `DashMap`; reads clone the stored value so no guard outlives the call.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use threadline_core::repository::graph::GraphRepository;
use threadline_core::repository::session::SessionRepository;
use threadline_types::error::RepositoryError;
use threadline_types::graph::{StepDefinition, TransitionDefinition, WorkflowGraph};
use threadline_types::session::{Session, SessionSnapshot};

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A loaded graph with its steps indexed by id.
#[derive(Debug, Clone)]
pub struct InMemoryGraphRepository {
    graph: Arc<WorkflowGraph>,
    step_index: Arc<HashMap<String, usize>>,
}

impl InMemoryGraphRepository {
    pub fn new(graph: WorkflowGraph) -> Self {
        let step_index = graph
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.id.clone(), i))
            .collect();
        Self {
            graph: Arc::new(graph),
            step_index: Arc::new(step_index),
        }
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }
}

impl GraphRepository for InMemoryGraphRepository {
    async fn root_step_id(&self) -> Result<String, RepositoryError> {
        Ok(self.graph.root.clone())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
        Ok(self
            .step_index
            .get(step_id)
            .and_then(|&i| self.graph.steps.get(i))
            .cloned())
    }

    async fn outgoing_transitions(
        &self,
        source: &str,
    ) -> Result<Vec<TransitionDefinition>, RepositoryError> {
        Ok(self.graph.outgoing(source).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Process-local session store. Contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionRepository {
    sessions: Arc<DashMap<String, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionRepository for InMemorySessionRepository {
    async fn create_session(&self, session: &Session) -> Result<(), RepositoryError> {
        match self.sessions.entry(session.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "session '{}' already exists",
                session.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.get(id).map(|r| r.value().clone()))
    }

    async fn save_session(&self, session: &Session) -> Result<(), RepositoryError> {
        match self.sessions.get_mut(&session.id) {
            Some(mut stored) => {
                *stored = session.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, RepositoryError> {
        let mut snapshots: Vec<SessionSnapshot> =
            self.sessions.iter().map(|r| r.value().snapshot()).collect();
        snapshots.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(snapshots)
    }
}

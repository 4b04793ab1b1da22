//! Storage backend selection.
//!
//! The repository traits use `impl Future` returns and are not object
//! safe, so the binary picks a backend at startup through these enums,
//! which delegate each call to the chosen implementation.

use threadline_core::repository::graph::GraphRepository;
use threadline_core::repository::session::SessionRepository;
use threadline_types::error::RepositoryError;
use threadline_types::graph::{StepDefinition, TransitionDefinition, WorkflowGraph};
use threadline_types::session::{Session, SessionSnapshot};

use crate::memory::{InMemoryGraphRepository, InMemorySessionRepository};
use crate::sqlite::graph::SqliteGraphRepository;
use crate::sqlite::pool::DatabasePool;
use crate::sqlite::session::SqliteSessionRepository;

/// Where session state lives.
pub enum SessionBackend {
    Memory(InMemorySessionRepository),
    Sqlite(SqliteSessionRepository),
}

impl SessionBackend {
    pub fn memory() -> Self {
        SessionBackend::Memory(InMemorySessionRepository::new())
    }

    pub fn sqlite(pool: DatabasePool) -> Self {
        SessionBackend::Sqlite(SqliteSessionRepository::new(pool))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionBackend::Memory(_) => "memory",
            SessionBackend::Sqlite(_) => "sqlite",
        }
    }
}

impl SessionRepository for SessionBackend {
    async fn create_session(&self, session: &Session) -> Result<(), RepositoryError> {
        match self {
            SessionBackend::Memory(repo) => repo.create_session(session).await,
            SessionBackend::Sqlite(repo) => repo.create_session(session).await,
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, RepositoryError> {
        match self {
            SessionBackend::Memory(repo) => repo.get_session(id).await,
            SessionBackend::Sqlite(repo) => repo.get_session(id).await,
        }
    }

    async fn save_session(&self, session: &Session) -> Result<(), RepositoryError> {
        match self {
            SessionBackend::Memory(repo) => repo.save_session(session).await,
            SessionBackend::Sqlite(repo) => repo.save_session(session).await,
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, RepositoryError> {
        match self {
            SessionBackend::Memory(repo) => repo.list_sessions().await,
            SessionBackend::Sqlite(repo) => repo.list_sessions().await,
        }
    }
}

/// Where the graph definition is read from.
pub enum GraphBackend {
    Memory(InMemoryGraphRepository),
    Sqlite(SqliteGraphRepository),
}

impl GraphBackend {
    pub fn memory(graph: WorkflowGraph) -> Self {
        GraphBackend::Memory(InMemoryGraphRepository::new(graph))
    }

    pub fn sqlite(pool: DatabasePool) -> Self {
        GraphBackend::Sqlite(SqliteGraphRepository::new(pool))
    }
}

impl GraphRepository for GraphBackend {
    async fn root_step_id(&self) -> Result<String, RepositoryError> {
        match self {
            GraphBackend::Memory(repo) => repo.root_step_id().await,
            GraphBackend::Sqlite(repo) => repo.root_step_id().await,
        }
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
        match self {
            GraphBackend::Memory(repo) => repo.get_step(step_id).await,
            GraphBackend::Sqlite(repo) => repo.get_step(step_id).await,
        }
    }

    async fn outgoing_transitions(
        &self,
        source: &str,
    ) -> Result<Vec<TransitionDefinition>, RepositoryError> {
        match self {
            GraphBackend::Memory(repo) => repo.outgoing_transitions(source).await,
            GraphBackend::Sqlite(repo) => repo.outgoing_transitions(source).await,
        }
    }
}

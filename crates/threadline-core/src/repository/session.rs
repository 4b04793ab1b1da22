//! Session repository trait definition.

use threadline_types::error::RepositoryError;
use threadline_types::session::{Session, SessionSnapshot};

/// Durable store of session state.
///
/// Implementations must round-trip every field unchanged in type.
pub trait SessionRepository: Send + Sync {
    /// Insert a new session. Fails with `RepositoryError::Conflict` if the id
    /// is taken.
    fn create_session(
        &self,
        session: &Session,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_session(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Session>, RepositoryError>> + Send;

    /// Overwrite an existing session. Fails with `RepositoryError::NotFound`
    /// if it was never created.
    fn save_session(
        &self,
        session: &Session,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Snapshots of all sessions, most recently updated first.
    fn list_sessions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<SessionSnapshot>, RepositoryError>> + Send;
}

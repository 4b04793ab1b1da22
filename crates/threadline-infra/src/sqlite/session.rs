//! SQLite session repository implementation.
//!
//! The full session is stored as a JSON `state` column. `status`, `pass`
//! and the timestamps are duplicated into their own columns for listing.

use chrono::{DateTime, Utc};
use sqlx::Row;
use threadline_core::repository::session::SessionRepository;
use threadline_types::error::RepositoryError;
use threadline_types::session::{Session, SessionSnapshot};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SessionRepository`.
pub struct SqliteSessionRepository {
    pool: DatabasePool,
}

impl SqliteSessionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct SessionRow {
    id: String,
    state: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            state: row.try_get("state")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_session(self) -> Result<Session, RepositoryError> {
        let mut session: Session = serde_json::from_str(&self.state).map_err(|e| {
            RepositoryError::Query(format!("invalid session state JSON for '{}': {e}", self.id))
        })?;
        // The column is authoritative if the two ever disagree.
        session.updated_at = parse_datetime(&self.updated_at)?;
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn state_json(session: &Session) -> Result<String, RepositoryError> {
    serde_json::to_string(session)
        .map_err(|e| RepositoryError::Query(format!("serialize session: {e}")))
}

// ---------------------------------------------------------------------------
// SessionRepository impl
// ---------------------------------------------------------------------------

impl SessionRepository for SqliteSessionRepository {
    async fn create_session(&self, session: &Session) -> Result<(), RepositoryError> {
        let state = state_json(session)?;

        let result = sqlx::query(
            "INSERT INTO sessions (id, status, pass, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.status.to_string())
        .bind(session.pass as i64)
        .bind(&state)
        .bind(format_datetime(&session.created_at))
        .bind(format_datetime(&session.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => {
                tracing::debug!(session_id = session.id.as_str(), "session created");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => Err(
                RepositoryError::Conflict(format!("session '{}' already exists", session.id)),
            ),
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query("SELECT id, state, updated_at FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let row = SessionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(row.into_session()?))
            }
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &Session) -> Result<(), RepositoryError> {
        let state = state_json(session)?;

        let result = sqlx::query(
            "UPDATE sessions SET status = ?, pass = ?, state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(session.status.to_string())
        .bind(session.pass as i64)
        .bind(&state)
        .bind(format_datetime(&session.updated_at))
        .bind(&session.id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, RepositoryError> {
        let rows = sqlx::query("SELECT id, state, updated_at FROM sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| -> Result<SessionSnapshot, RepositoryError> {
                let row = SessionRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(row.into_session()?.snapshot())
            })
            .collect()
    }
}

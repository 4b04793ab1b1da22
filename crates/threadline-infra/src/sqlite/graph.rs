//! SQLite graph repository implementation.
//!
//! A database holds one graph. Importing replaces it wholesale; steps and
//! transitions keep a `position` column so declaration order survives.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::Row;
use threadline_core::repository::graph::GraphRepository;
use threadline_types::error::RepositoryError;
use threadline_types::graph::{
    ConditionOperator, StepDefinition, TransitionDefinition, WorkflowGraph,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `GraphRepository`.
pub struct SqliteGraphRepository {
    pool: DatabasePool,
}

impl SqliteGraphRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Replace the stored graph with `graph` in a single transaction.
    pub async fn import_graph(&self, graph: &WorkflowGraph) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for statement in [
            "DELETE FROM transitions",
            "DELETE FROM steps",
            "DELETE FROM graph_meta",
        ] {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        sqlx::query(
            "INSERT INTO graph_meta (id, name, description, root, imported_at) VALUES (1, ?, ?, ?, ?)",
        )
        .bind(&graph.name)
        .bind(&graph.description)
        .bind(&graph.root)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for (position, step) in graph.steps.iter().enumerate() {
            let input = serde_json::to_string(&step.input)
                .map_err(|e| RepositoryError::Query(format!("serialize step input: {e}")))?;
            sqlx::query(
                "INSERT INTO steps (id, function, input, description, position) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&step.id)
            .bind(&step.function)
            .bind(&input)
            .bind(&step.description)
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.message().contains("UNIQUE") {
                        return RepositoryError::Conflict(format!(
                            "duplicate step '{}'",
                            step.id
                        ));
                    }
                }
                RepositoryError::Query(e.to_string())
            })?;
        }

        for (position, transition) in graph.transitions.iter().enumerate() {
            let conditions = serde_json::to_string(&transition.conditions)
                .map_err(|e| RepositoryError::Query(format!("serialize conditions: {e}")))?;
            sqlx::query(
                "INSERT INTO transitions (id, source, target, conditions, operator, position)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&transition.id)
            .bind(&transition.source)
            .bind(&transition.target)
            .bind(&conditions)
            .bind(transition.operator.to_string())
            .bind(position as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::info!(
            graph = graph.name.as_str(),
            steps = graph.steps.len(),
            transitions = graph.transitions.len(),
            "graph imported"
        );
        Ok(())
    }

    /// Reassemble the stored graph, if one was imported.
    pub async fn load_graph(&self) -> Result<Option<WorkflowGraph>, RepositoryError> {
        let meta = sqlx::query("SELECT name, description, root FROM graph_meta WHERE id = 1")
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(meta) = meta else {
            return Ok(None);
        };

        let step_rows = sqlx::query("SELECT * FROM steps ORDER BY position")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let transition_rows = sqlx::query("SELECT * FROM transitions ORDER BY position")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(Some(WorkflowGraph {
            name: meta
                .try_get("name")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            description: meta
                .try_get("description")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            root: meta
                .try_get("root")
                .map_err(|e| RepositoryError::Query(e.to_string()))?,
            steps: step_rows.iter().map(row_to_step).collect::<Result<_, _>>()?,
            transitions: transition_rows
                .iter()
                .map(row_to_transition)
                .collect::<Result<_, _>>()?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<StepDefinition, RepositoryError> {
    let input: String = row
        .try_get("input")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let input: Map<String, Value> = serde_json::from_str(&input)
        .map_err(|e| RepositoryError::Query(format!("invalid step input JSON: {e}")))?;

    Ok(StepDefinition {
        id: row
            .try_get("id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        function: row
            .try_get("function")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        input,
        description: row
            .try_get("description")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
    })
}

fn row_to_transition(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<TransitionDefinition, RepositoryError> {
    let conditions: String = row
        .try_get("conditions")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let conditions: Vec<String> = serde_json::from_str(&conditions)
        .map_err(|e| RepositoryError::Query(format!("invalid conditions JSON: {e}")))?;
    let operator: String = row
        .try_get("operator")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
    let operator: ConditionOperator = operator.parse().map_err(RepositoryError::Query)?;

    Ok(TransitionDefinition {
        id: row
            .try_get("id")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        source: row
            .try_get("source")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        target: row
            .try_get("target")
            .map_err(|e| RepositoryError::Query(e.to_string()))?,
        conditions,
        operator,
    })
}

// ---------------------------------------------------------------------------
// GraphRepository impl
// ---------------------------------------------------------------------------

impl GraphRepository for SqliteGraphRepository {
    async fn root_step_id(&self) -> Result<String, RepositoryError> {
        let row = sqlx::query("SELECT root FROM graph_meta WHERE id = 1")
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;
        row.try_get("root")
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM steps WHERE id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(row_to_step(&row)?)),
            None => Ok(None),
        }
    }

    async fn outgoing_transitions(
        &self,
        source: &str,
    ) -> Result<Vec<TransitionDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM transitions WHERE source = ? ORDER BY position")
            .bind(source)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(row_to_transition).collect()
    }
}

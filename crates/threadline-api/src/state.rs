//! Application state wiring storage, the function registry and the engine.
//!
//! AppState holds the concrete engine used by both CLI commands and REST
//! API handlers. The engine is generic over its repositories; AppState pins
//! it to the backend enums from `threadline-infra`.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use threadline_core::event::EventBus;
use threadline_core::workflow::{FunctionRegistry, WorkflowEngine, load_graph_file, validate_graph};
use threadline_infra::backend::{GraphBackend, SessionBackend};
use threadline_infra::sqlite::graph::SqliteGraphRepository;
use threadline_infra::sqlite::pool::{DatabasePool, default_database_url};
use threadline_types::config::ThreadlineConfig;
use threadline_types::graph::WorkflowGraph;

/// Engine pinned to the runtime-selected backends.
pub type Engine = WorkflowEngine<GraphBackend, SessionBackend>;

/// How the graph is provided at startup.
pub enum GraphSource<'a> {
    /// Load and validate a YAML/JSON file.
    File(&'a Path),
    /// Read the graph previously imported into the database.
    Database,
    /// Do not require a graph (session inspection commands).
    None,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub config: Arc<ThreadlineConfig>,
}

impl AppState {
    /// Initialize storage and the engine.
    ///
    /// Sessions use SQLite when `storage.database_url` is set and memory
    /// otherwise. When a graph is given, retries of stored sessions with
    /// deferred steps are re-armed.
    pub async fn init(config: ThreadlineConfig, source: GraphSource<'_>) -> anyhow::Result<Self> {
        let registry = FunctionRegistry::with_builtins();
        let runs_graph = !matches!(source, GraphSource::None);

        let pool = match config.storage.database_url.as_deref() {
            Some(url) => Some(open_pool(url).await?),
            None => None,
        };

        let graph = match source {
            GraphSource::File(path) => {
                GraphBackend::memory(load_validated(path, &registry)?)
            }
            GraphSource::Database => {
                let Some(pool) = pool.clone() else {
                    bail!("no graph given; pass --graph or configure storage.database_url");
                };
                let stored = SqliteGraphRepository::new(pool.clone())
                    .load_graph()
                    .await?
                    .context("no graph imported into the database; run `tline import` first")?;
                validate_graph(&stored, Some(&registry))?;
                GraphBackend::sqlite(pool)
            }
            GraphSource::None => match pool.clone() {
                Some(pool) => GraphBackend::sqlite(pool),
                None => GraphBackend::memory(empty_graph()),
            },
        };

        let sessions = match pool {
            Some(pool) => SessionBackend::sqlite(pool),
            None => SessionBackend::memory(),
        };
        tracing::debug!(sessions = sessions.kind(), "storage ready");

        let engine = WorkflowEngine::new(
            graph,
            sessions,
            registry,
            config.engine.clone(),
            EventBus::default(),
        );
        if runs_graph {
            engine
                .recover()
                .await
                .context("failed to recover deferred sessions")?;
        }

        Ok(Self {
            engine,
            config: Arc::new(config),
        })
    }
}

/// Load a graph file and check every step's function is registered.
pub fn load_validated(path: &Path, registry: &FunctionRegistry) -> anyhow::Result<WorkflowGraph> {
    let graph = load_graph_file(path)
        .with_context(|| format!("failed to load graph '{}'", path.display()))?;
    validate_graph(&graph, Some(registry))
        .with_context(|| format!("invalid graph '{}'", path.display()))?;
    Ok(graph)
}

/// Configured database URL, else the default location in the data directory.
pub fn database_url_or_default(config: &ThreadlineConfig) -> String {
    config
        .storage
        .database_url
        .clone()
        .unwrap_or_else(default_database_url)
}

/// Open the pool, creating the data directory for the default location.
pub async fn open_pool(url: &str) -> anyhow::Result<DatabasePool> {
    if url == default_database_url() {
        tokio::fs::create_dir_all(threadline_infra::config::data_dir()).await?;
    }
    DatabasePool::new(url)
        .await
        .with_context(|| format!("failed to open database '{url}'"))
}

fn empty_graph() -> WorkflowGraph {
    WorkflowGraph {
        name: String::new(),
        description: None,
        root: String::new(),
        steps: Vec::new(),
        transitions: Vec::new(),
    }
}

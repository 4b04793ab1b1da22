//! Graph file commands: validate, import.

use std::path::Path;

use anyhow::Result;
use console::style;
use threadline_core::workflow::FunctionRegistry;
use threadline_infra::sqlite::graph::SqliteGraphRepository;
use threadline_types::config::ThreadlineConfig;
use threadline_types::graph::WorkflowGraph;

use crate::state::{database_url_or_default, load_validated, open_pool};

/// Load a graph file, validate it against the built-in functions and print
/// a summary.
pub fn validate(path: &Path, json: bool) -> Result<()> {
    let graph = load_validated(path, &FunctionRegistry::with_builtins())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary(&graph))?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Graph '{}' is valid",
        style("✓").green().bold(),
        style(&graph.name).cyan()
    );
    print_counts(&graph);
    Ok(())
}

/// Validate a graph file and store it in the configured database.
pub async fn import(config: &ThreadlineConfig, path: &Path, json: bool) -> Result<()> {
    let graph = load_validated(path, &FunctionRegistry::with_builtins())?;
    let url = database_url_or_default(config);
    let pool = open_pool(&url).await?;

    SqliteGraphRepository::new(pool).import_graph(&graph).await?;

    if json {
        let mut out = summary(&graph);
        out["database_url"] = serde_json::Value::String(url);
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Imported '{}' into {}",
        style("✓").green().bold(),
        style(&graph.name).cyan(),
        style(&url).dim()
    );
    print_counts(&graph);
    Ok(())
}

fn summary(graph: &WorkflowGraph) -> serde_json::Value {
    serde_json::json!({
        "name": graph.name,
        "root": graph.root,
        "steps": graph.steps.len(),
        "transitions": graph.transitions.len(),
    })
}

fn print_counts(graph: &WorkflowGraph) {
    println!(
        "    root {}, {} step{}, {} transition{}",
        style(&graph.root).yellow(),
        graph.steps.len(),
        if graph.steps.len() == 1 { "" } else { "s" },
        graph.transitions.len(),
        if graph.transitions.len() == 1 { "" } else { "s" },
    );
    println!();
}

//! Threadline CLI and REST API entry point.
//!
//! Binary name: `tline`
//!
//! Parses CLI arguments, loads configuration, then dispatches to the
//! appropriate command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use threadline_infra::config::load_config;
use threadline_observe::{LogFormat, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::{AppState, GraphSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_tracing(cli::log_filter(cli.verbose), format, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need config or storage
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "tline", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref()).await;

    let result = dispatch(cli.command, config, cli.json).await;
    shutdown_tracing();
    result
}

async fn dispatch(
    command: Commands,
    config: threadline_types::config::ThreadlineConfig,
    json: bool,
) -> anyhow::Result<()> {
    match command {
        Commands::Run { graph, session_id } => {
            let source = graph_source(graph.as_deref());
            let state = AppState::init(config, source).await?;
            cli::run::run_chat(&state, session_id, json).await?;
        }

        Commands::Validate { graph } => {
            cli::graph::validate(&graph, json)?;
        }

        Commands::Import { graph } => {
            cli::graph::import(&config, &graph, json).await?;
        }

        Commands::Session { action } => {
            cli::session::run(config, action, json).await?;
        }

        Commands::Serve { graph, bind } => {
            let addr = bind.unwrap_or_else(|| config.server.bind.clone());
            let state = AppState::init(config, graph_source(graph.as_deref())).await?;

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            println!(
                "  {} Threadline API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());
            tracing::info!(%addr, "server started");

            let router = http::router::build_router(state);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn graph_source(path: Option<&std::path::Path>) -> GraphSource<'_> {
    match path {
        Some(path) => GraphSource::File(path),
        None => GraphSource::Database,
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

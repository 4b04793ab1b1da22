//! CLI command definitions for the `tline` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod graph;
pub mod run;
pub mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run conversational workflow graphs.
#[derive(Parser)]
#[command(name = "tline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: ./threadline.toml, then ~/.threadline/config.toml).
    #[arg(long, global = true, env = "THREADLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans to stdout via OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chat with a workflow graph in the terminal.
    Run {
        /// Graph file (YAML or JSON). Defaults to the imported graph.
        #[arg(long, short)]
        graph: Option<PathBuf>,

        /// Session id to use instead of a generated one.
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Load and validate a graph file.
    Validate {
        #[arg(long, short)]
        graph: PathBuf,
    },

    /// Start the REST API server.
    Serve {
        /// Graph file (YAML or JSON). Defaults to the imported graph.
        #[arg(long, short)]
        graph: Option<PathBuf>,

        /// Address to bind (overrides `server.bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Store a graph in the database.
    Import {
        #[arg(long, short)]
        graph: PathBuf,
    },

    /// Inspect and manage stored sessions.
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum SessionCommand {
    /// List sessions, most recent first.
    #[command(alias = "ls")]
    List,

    /// Show a session's status, frontier and deferred steps.
    Show { id: String },

    /// Print a session's chat history.
    History { id: String },

    /// Cancel a live session.
    Cancel { id: String },
}

/// Log filter for a verbosity level.
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "info,threadline_core=debug,threadline_infra=debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_session_show_with_global_flags() {
        let cli = Cli::try_parse_from(["tline", "session", "show", "abc", "--json", "-vv"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Session {
                action: SessionCommand::Show { ref id }
            } if id == "abc"
        ));
    }

    #[test]
    fn test_log_filter_levels() {
        assert_eq!(log_filter(0), "warn");
        assert_eq!(log_filter(1), "info");
        assert!(log_filter(2).contains("threadline_core=debug"));
        assert_eq!(log_filter(9), "trace");
    }
}

//! Session management CLI commands: list, show, history, cancel.

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use threadline_types::config::ThreadlineConfig;
use threadline_types::session::{ChatRole, SessionStatus};

use crate::cli::SessionCommand;
use crate::state::{AppState, GraphSource};

/// Run a `tline session` subcommand against the configured database.
pub async fn run(config: ThreadlineConfig, action: SessionCommand, json: bool) -> Result<()> {
    if config.storage.database_url.is_none() {
        bail!("session commands need a database; set storage.database_url or THREADLINE_DATABASE_URL");
    }
    let state = AppState::init(config, GraphSource::None).await?;

    match action {
        SessionCommand::List => list_sessions(&state, json).await,
        SessionCommand::Show { id } => show_session(&state, &id, json).await,
        SessionCommand::History { id } => show_history(&state, &id, json).await,
        SessionCommand::Cancel { id } => cancel_session(&state, &id, json).await,
    }
}

async fn list_sessions(state: &AppState, json: bool) -> Result<()> {
    let sessions = state.engine.list_sessions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!();
        println!("  {} No sessions found.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Session").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Passes").fg(Color::White),
        Cell::new("Frontier").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for session in &sessions {
        table.add_row(vec![
            Cell::new(&session.id).fg(Color::Cyan),
            status_cell(session.status),
            Cell::new(session.pass.to_string()).fg(Color::White),
            Cell::new(session.frontier.join(", ")).fg(Color::DarkGrey),
            Cell::new(session.updated_at.format("%Y-%m-%d %H:%M").to_string())
                .fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} session{}",
        style(sessions.len()).bold(),
        if sessions.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

async fn show_session(state: &AppState, id: &str, json: bool) -> Result<()> {
    let snapshot = state.engine.snapshot(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!();
    println!(
        "  Session {}  {}",
        style(&snapshot.id).cyan().bold(),
        styled_status(snapshot.status)
    );
    println!("    pass       {}", snapshot.pass);
    println!("    frontier   {}", list_or_dash(&snapshot.frontier));
    println!("    carry-over {}", list_or_dash(&snapshot.carry_over));
    println!("    updated    {}", snapshot.updated_at.to_rfc3339());
    if let Some(error) = &snapshot.last_error {
        println!(
            "    errors     {} (last: {})",
            snapshot.error_count,
            style(error).red()
        );
    }
    for deferred in &snapshot.deferred {
        println!(
            "    {} {} waiting on {} (attempt {})",
            style("⏳").dim(),
            style(&deferred.step_id).yellow(),
            deferred.missing.join(", "),
            deferred.attempts
        );
    }
    println!();
    Ok(())
}

async fn show_history(state: &AppState, id: &str, json: bool) -> Result<()> {
    let history = state.engine.history(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    println!();
    for message in &history {
        let who = match message.role {
            ChatRole::User => style("you").green().bold(),
            ChatRole::Assistant => style("bot").cyan().bold(),
        };
        println!("  {who}  {}", message.content);
    }
    if history.is_empty() {
        println!("  {}", style("(no messages)").dim());
    }
    println!();
    Ok(())
}

async fn cancel_session(state: &AppState, id: &str, json: bool) -> Result<()> {
    let response = state.engine.cancel(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Session {} cancelled",
        style("✓").green().bold(),
        style(id).cyan()
    );
    println!();
    Ok(())
}

fn status_cell(status: SessionStatus) -> Cell {
    let color = match status {
        SessionStatus::Active => Color::Green,
        SessionStatus::AwaitingInput => Color::Yellow,
        SessionStatus::Completed => Color::DarkGrey,
        SessionStatus::Error => Color::Red,
        SessionStatus::Cancelled => Color::Magenta,
    };
    Cell::new(status.to_string()).fg(color)
}

pub(crate) fn styled_status(status: SessionStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        SessionStatus::Active => style(text).green(),
        SessionStatus::AwaitingInput => style(text).yellow(),
        SessionStatus::Completed => style(text).dim(),
        SessionStatus::Error => style(text).red(),
        SessionStatus::Cancelled => style(text).magenta(),
    }
}

fn list_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

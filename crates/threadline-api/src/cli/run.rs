//! Interactive terminal chat against a workflow graph.
//!
//! Input is read with `rustyline_async`; output goes through its
//! `SharedWriter` so it does not clobber the prompt. Replies that arrive
//! from background retries are picked up from the session history.

use std::io::Write;
use std::time::Duration;

use anyhow::Result;
use console::style;
use rustyline_async::{Readline, ReadlineEvent, SharedWriter};
use threadline_types::event::EngineEvent;
use threadline_types::session::{ChatRole, SessionStatus};
use tokio::sync::broadcast;

use crate::cli::session::styled_status;
use crate::state::AppState;

/// Leave the chat.
const QUIT_COMMAND: &str = "/quit";

/// Show the session snapshot.
const STATUS_COMMAND: &str = "/status";

/// Start a session and chat with it until it ends or the user quits.
pub async fn run_chat(state: &AppState, session_id: Option<String>, json: bool) -> Result<()> {
    let engine = &state.engine;
    let mut events = engine.subscribe();
    let (mut rl, mut out) = Readline::new(format!("{} ", style(">").green().bold()))?;

    let mut response = engine.start(session_id).await?;
    let id = response.session_id.clone();
    let wait = Duration::from_millis(state.config.engine.retry_delay_ms.max(50) * 2);
    let mut shown = 0usize;
    let mut fresh = true;

    writeln!(
        out,
        "\n  Session {}  (type {} to leave)\n",
        style(&id).cyan().bold(),
        style(QUIT_COMMAND).yellow()
    )?;

    loop {
        if json && fresh {
            writeln!(out, "{}", serde_json::to_string(&response)?)?;
        }
        fresh = false;
        shown = print_new_messages(state, &id, shown, &mut out).await?;

        match response.status {
            status if status.is_terminal() => {
                writeln!(out, "\n  Session {}", styled_status(status))?;
                if let Some(error) = &response.error {
                    writeln!(out, "  {}", style(error).red())?;
                }
                break;
            }
            SessionStatus::AwaitingInput => {
                let text = match rl.readline().await {
                    Ok(ReadlineEvent::Line(line)) => line.trim().to_string(),
                    Ok(ReadlineEvent::Eof) | Ok(ReadlineEvent::Interrupted) | Err(_) => {
                        writeln!(
                            out,
                            "\n  Session {} left awaiting input.",
                            style(&id).cyan()
                        )?;
                        break;
                    }
                };
                if text.is_empty() {
                    continue;
                }
                if text == QUIT_COMMAND {
                    break;
                }
                if text == STATUS_COMMAND {
                    let snapshot = engine.snapshot(&id).await?;
                    writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
                    continue;
                }
                rl.add_history_entry(text.clone());
                response = engine.resume(&id, &text).await?;
                fresh = true;
            }
            _ => {
                // Deferred steps are pending; let the retry timer run.
                wait_for_activity(&mut events, &id, wait).await;
                response = engine.advance(&id).await?;
                fresh = true;
            }
        }
    }

    rl.flush()?;
    Ok(())
}

/// Print assistant messages appended since `shown`. Returns the new count.
async fn print_new_messages(
    state: &AppState,
    session_id: &str,
    shown: usize,
    out: &mut SharedWriter,
) -> Result<usize> {
    let history = state.engine.history(session_id).await?;
    for message in history.iter().skip(shown) {
        if message.role == ChatRole::Assistant {
            writeln!(out, "  {}  {}", style("bot").cyan().bold(), message.content)?;
        }
    }
    Ok(history.len())
}

/// Wait until an event for `session_id` arrives or `max_wait` elapses.
async fn wait_for_activity(
    events: &mut broadcast::Receiver<EngineEvent>,
    session_id: &str,
    max_wait: Duration,
) {
    let _ = tokio::time::timeout(max_wait, async {
        loop {
            match events.recv().await {
                Ok(event) if event.session_id() == session_id => break,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => break,
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    })
    .await;
}

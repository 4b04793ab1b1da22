//! Session types for Threadline.
//!
//! A `Session` is one conversation walking a workflow graph. It carries the
//! cycle-indexed outputs of every executed step (`memory`), the frontier of
//! steps eligible to run next, the deferred steps waiting on unresolved
//! references, and the chat history exchanged with the human.
//!
//! All fields serialize losslessly so a session round-trips through any
//! store unchanged in type.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Steps are being processed (or waiting on deferred references).
    #[default]
    Active,
    /// Paused on an input-request step until the human replies.
    AwaitingInput,
    /// Frontier drained; nothing left to run.
    Completed,
    /// A step failed with a non-recoverable error.
    Error,
    /// Explicitly cancelled by a caller.
    Cancelled,
}

impl SessionStatus {
    /// Terminal sessions never run another step.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Cancelled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::AwaitingInput => write!(f, "awaiting_input"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Error => write!(f, "error"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "awaiting_input" => Ok(SessionStatus::AwaitingInput),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("invalid session status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One execution's output of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Per-step execution index (0 for the first run of the step).
    pub cycle: usize,
    /// Engine cycle during which the output was produced.
    pub pass: u64,
    /// Value returned by the bound function.
    pub value: Value,
    pub recorded_at: DateTime<Utc>,
}

/// A logged step failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step_id: String,
    /// Cycle index the failed execution would have produced.
    pub cycle: usize,
    pub pass: u64,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Who said a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message exchanged with the human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Step that produced (or received) the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

/// Bookkeeping for a step whose inputs did not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredStep {
    /// References that failed to resolve on the latest attempt.
    pub missing: Vec<String>,
    /// Number of attempts that ended unresolved.
    pub attempts: u32,
    pub deferred_at: DateTime<Utc>,
    /// Earliest time the step is retried without a resolvable pre-check.
    pub next_attempt_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Mutable state of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    /// Step id -> outputs, oldest first.
    #[serde(default)]
    pub memory: BTreeMap<String, Vec<OutputRecord>>,
    /// Ordered, duplicate-free step ids eligible to run next.
    #[serde(default)]
    pub frontier: Vec<String>,
    /// Frontier members set aside while awaiting input.
    #[serde(default)]
    pub carry_over: Vec<String>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub deferred: BTreeMap<String, DeferredStep>,
    /// Number of engine cycles run so far.
    #[serde(default)]
    pub pass: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create an active session positioned at `root`.
    pub fn new(id: impl Into<String>, root: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Active,
            memory: BTreeMap::new(),
            frontier: vec![root.to_string()],
            carry_over: Vec::new(),
            errors: Vec::new(),
            history: Vec::new(),
            deferred: BTreeMap::new(),
            pass: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// All recorded outputs of a step, oldest first.
    pub fn outputs(&self, step_id: &str) -> &[OutputRecord] {
        self.memory.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Newest output of a step.
    pub fn latest_output(&self, step_id: &str) -> Option<&OutputRecord> {
        self.outputs(step_id).last()
    }

    /// Output at a cycle index. Negative indexes count back from the newest
    /// (`-1` is the latest).
    pub fn output_at(&self, step_id: &str, cycle: i64) -> Option<&OutputRecord> {
        let outputs = self.outputs(step_id);
        let index = if cycle < 0 {
            let back = usize::try_from(cycle.unsigned_abs()).ok()?;
            outputs.len().checked_sub(back)?
        } else {
            usize::try_from(cycle).ok()?
        };
        outputs.get(index)
    }

    /// Cycle index the next execution of `step_id` will record.
    pub fn next_cycle(&self, step_id: &str) -> usize {
        self.outputs(step_id).len()
    }

    /// Append a new output for `step_id`, returning its cycle index.
    pub fn append_output(&mut self, step_id: &str, value: Value, pass: u64) -> usize {
        let records = self.memory.entry(step_id.to_string()).or_default();
        let cycle = records.len();
        records.push(OutputRecord {
            cycle,
            pass,
            value,
            recorded_at: Utc::now(),
        });
        cycle
    }

    /// Log a step failure at the cycle the step would have produced.
    pub fn record_error(&mut self, step_id: &str, message: impl Into<String>, recoverable: bool) {
        let cycle = self.next_cycle(step_id);
        self.errors.push(ErrorRecord {
            step_id: step_id.to_string(),
            cycle,
            pass: self.pass,
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        });
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }

    pub fn push_message(&mut self, role: ChatRole, content: impl Into<String>, step_id: Option<&str>) {
        self.history.push(ChatMessage {
            role,
            content: content.into(),
            step_id: step_id.map(str::to_string),
        });
    }

    /// The step the session is paused on, if any.
    pub fn awaiting_step(&self) -> Option<&str> {
        if self.status == SessionStatus::AwaitingInput {
            self.frontier.first().map(String::as_str)
        } else {
            None
        }
    }

    /// Whether an active session still has steps to run or retry.
    pub fn has_pending_steps(&self) -> bool {
        self.status == SessionStatus::Active && !self.frontier.is_empty()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Read-only summary for observability.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            status: self.status,
            frontier: self.frontier.clone(),
            carry_over: self.carry_over.clone(),
            deferred: self
                .deferred
                .iter()
                .map(|(step_id, entry)| DeferredSummary {
                    step_id: step_id.clone(),
                    missing: entry.missing.clone(),
                    attempts: entry.attempts,
                    next_attempt_at: entry.next_attempt_at,
                })
                .collect(),
            pass: self.pass,
            error_count: self.errors.len(),
            last_error: self.last_error().map(|e| e.message.clone()),
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Observability view of a session: status, frontier and deferred steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub status: SessionStatus,
    pub frontier: Vec<String>,
    pub carry_over: Vec<String>,
    pub deferred: Vec<DeferredSummary>,
    pub pass: u64,
    pub error_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A deferred step and the references it is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeferredSummary {
    pub step_id: String,
    pub missing: Vec<String>,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
}

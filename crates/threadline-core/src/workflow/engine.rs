//! Workflow engine: the per-session state machine.
//!
//! Each call takes the session's lock, loads it, runs cycles until the
//! session pauses, completes, fails or has only deferred steps left, and
//! saves it after every cycle. A cycle:
//!
//! 1. Splits the frontier into runnable members and deferred members whose
//!    retry is not yet due.
//! 2. Executes runnable members in frontier order, in segments split at
//!    input-request steps. A segment runs concurrently on a `JoinSet`
//!    bounded by a `Semaphore`, against the state as of cycle start.
//! 3. Commits every outcome in frontier order (barrier), then evaluates the
//!    outgoing transitions of completed steps against the committed state.
//! 4. Computes the next frontier (fired targets plus still-deferred steps),
//!    or pauses on a successful input request.
//!
//! Background retries of deferred steps arrive through the deferral
//! manager's wake channel and go through the same lock.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use threadline_types::config::EngineConfig;
use threadline_types::error::RepositoryError;
use threadline_types::event::EngineEvent;
use threadline_types::graph::StepDefinition;
use threadline_types::session::{ChatMessage, ChatRole, Session, SessionSnapshot, SessionStatus};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::{GraphRepository, SessionRepository};

use super::deferral::DeferralManager;
use super::executor::{StepExecutor, StepOutcome};
use super::function::{FunctionError, FunctionKind, SessionView};
use super::registry::FunctionRegistry;
use super::transition::TransitionEvaluator;
use super::value::value_to_string;

// ---------------------------------------------------------------------------
// Errors and responses
// ---------------------------------------------------------------------------

/// Rejected engine operations. A rejection never mutates the session.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session '{id}' is {status}")]
    SessionTerminal { id: String, status: SessionStatus },

    #[error("session '{id}' is not awaiting input (status: {status})")]
    NotAwaitingInput { id: String, status: SessionStatus },

    #[error("session already exists: {0}")]
    SessionExists(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// What a caller sees after a mutating engine call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub awaiting_input: bool,
    /// Prompt of the step the session is paused on.
    pub statement: Option<String>,
    /// Replies emitted during this call, in order.
    pub replies: Vec<String>,
    /// Active session with deferred steps still to retry.
    pub has_pending_steps: bool,
    /// Last error message when the session is in `error`.
    pub error: Option<String>,
}

impl EngineResponse {
    fn from_session(session: &Session, replies: Vec<String>) -> Self {
        let error = (session.status == SessionStatus::Error)
            .then(|| session.last_error().map(|e| e.message.clone()))
            .flatten();
        Self {
            session_id: session.id.clone(),
            status: session.status,
            awaiting_input: session.status == SessionStatus::AwaitingInput,
            statement: statement_of(session),
            replies,
            has_pending_steps: session.has_pending_steps(),
            error,
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleResult {
    /// The next frontier is ready; run another cycle.
    Continue,
    /// Every frontier member is deferred and none is due.
    Waiting,
    Paused,
    Completed,
    Failed,
    /// The session was cancelled mid-cycle; nothing was written.
    Cancelled,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct EngineInner<G, S> {
    graph: G,
    sessions: S,
    executor: Arc<StepExecutor>,
    evaluator: TransitionEvaluator,
    deferral: DeferralManager,
    /// Per-session locks keyed by session id.
    locks: DashMap<String, Arc<Mutex<()>>>,
    event_bus: EventBus,
    config: EngineConfig,
}

/// Drives sessions through a workflow graph.
///
/// Generic over the graph and session repositories for storage flexibility.
/// Cloning is cheap and shares all state.
pub struct WorkflowEngine<G, S> {
    inner: Arc<EngineInner<G, S>>,
}

impl<G, S> Clone for WorkflowEngine<G, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G, S> WorkflowEngine<G, S>
where
    G: GraphRepository + 'static,
    S: SessionRepository + 'static,
{
    /// Create an engine.
    ///
    /// When called inside a tokio runtime this also starts the task that
    /// runs background retries of deferred steps.
    pub fn new(
        graph: G,
        sessions: S,
        registry: FunctionRegistry,
        config: EngineConfig,
        event_bus: EventBus,
    ) -> Self {
        let (deferral, wake_rx) =
            DeferralManager::new(Duration::from_millis(config.retry_delay_ms));
        let executor = StepExecutor::new(Arc::new(registry))
            .with_timeout(Duration::from_secs(config.step_timeout_secs));

        let inner = Arc::new(EngineInner {
            graph,
            sessions,
            executor: Arc::new(executor),
            evaluator: TransitionEvaluator::new(),
            deferral,
            locks: DashMap::new(),
            event_bus,
            config,
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(dispatch_retries(Arc::downgrade(&inner), wake_rx));
            }
            Err(_) => {
                tracing::warn!("no tokio runtime; deferred steps retry only on advance");
            }
        }

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.event_bus.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &S {
        &self.inner.sessions
    }

    // -----------------------------------------------------------------------
    // Public operations
    // -----------------------------------------------------------------------

    /// Create a session at the graph root and run it until it pauses,
    /// completes or only has deferred steps left.
    pub async fn start(&self, session_id: Option<String>) -> Result<EngineResponse, EngineError> {
        let id = session_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let root = self.inner.graph.root_step_id().await?;
        let mut session = Session::new(id.clone(), &root);

        let guard = self.lock_for(&id).lock_owned().await;

        if let Err(e) = self.inner.sessions.create_session(&session).await {
            drop(guard);
            self.forget_lock(&id);
            return Err(match e {
                RepositoryError::Conflict(_) => EngineError::SessionExists(id),
                other => EngineError::Repository(other),
            });
        }

        tracing::info!(session_id = %id, root = %root, "session started");
        self.publish(EngineEvent::SessionStarted {
            session_id: id.clone(),
            root,
        });

        let mut replies = Vec::new();
        self.drive(&mut session, &mut replies).await?;
        Ok(EngineResponse::from_session(&session, replies))
    }

    /// Merge a human reply into the paused step and continue.
    pub async fn resume(&self, session_id: &str, text: &str) -> Result<EngineResponse, EngineError> {
        let (_guard, mut session) = self.lock_and_load(session_id).await?;
        reject_terminal(&session, self.inner.deferral.is_cancelled(session_id))?;
        let Some(ask) = session.awaiting_step().map(str::to_string) else {
            return Err(EngineError::NotAwaitingInput {
                id: session.id.clone(),
                status: session.status,
            });
        };

        merge_reply(&mut session, &ask, &self.inner.config.response_key, text);
        session.push_message(ChatRole::User, text, Some(&ask));
        session.status = SessionStatus::Active;

        let transitions = self.inner.graph.outgoing_transitions(&ask).await?;
        let mut frontier = self.inner.evaluator.fired_targets(&transitions, &session);
        for id in std::mem::take(&mut session.carry_over) {
            push_unique(&mut frontier, id);
        }
        session.frontier = frontier;

        tracing::info!(
            session_id,
            step_id = ask.as_str(),
            frontier = ?session.frontier,
            "session resumed"
        );
        self.publish(EngineEvent::SessionResumed {
            session_id: session_id.to_string(),
            step_id: ask,
        });

        let mut replies = Vec::new();
        self.drive(&mut session, &mut replies).await?;
        Ok(EngineResponse::from_session(&session, replies))
    }

    /// Process pending steps of an active session now. A paused session is
    /// returned unchanged.
    pub async fn advance(&self, session_id: &str) -> Result<EngineResponse, EngineError> {
        let (_guard, mut session) = self.lock_and_load(session_id).await?;
        reject_terminal(&session, self.inner.deferral.is_cancelled(session_id))?;

        let mut replies = Vec::new();
        if session.status == SessionStatus::Active {
            self.drive(&mut session, &mut replies).await?;
        }
        Ok(EngineResponse::from_session(&session, replies))
    }

    /// Read-only summary of a session.
    pub async fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot, EngineError> {
        Ok(self.load(session_id).await?.snapshot())
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>, EngineError> {
        Ok(self.load(session_id).await?.history)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, EngineError> {
        Ok(self.inner.sessions.list_sessions().await?)
    }

    /// Cancel a live session. Pending retries stop and a cycle in flight
    /// discards its results.
    pub async fn cancel(&self, session_id: &str) -> Result<EngineResponse, EngineError> {
        let current = self.load(session_id).await?;
        reject_terminal(&current, false)?;

        // Trip the token before waiting for the lock so an in-flight cycle
        // sees it before committing.
        self.inner.deferral.cancel(session_id);

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let mut session = self.load(session_id).await?;
        if session.status.is_terminal() {
            let status = session.status;
            self.release(session_id);
            return Err(EngineError::SessionTerminal {
                id: session.id,
                status,
            });
        }

        session.status = SessionStatus::Cancelled;
        session.touch();
        self.inner.sessions.save_session(&session).await?;
        self.release(session_id);

        tracing::info!(session_id, pass = session.pass, "session cancelled");
        self.publish(EngineEvent::SessionCancelled {
            session_id: session_id.to_string(),
        });
        Ok(EngineResponse::from_session(&session, Vec::new()))
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Background retry entry point, woken by the deferral timer.
    async fn retry_deferred(&self, session_id: &str) -> Result<(), EngineError> {
        let token = self.inner.deferral.token(session_id);
        if token.is_cancelled() {
            return Ok(());
        }

        let (_guard, mut session) = match self.lock_and_load(session_id).await {
            Ok(locked) => locked,
            Err(EngineError::SessionNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Re-check under the lock: cancel may have won the race.
        if token.is_cancelled() {
            return Ok(());
        }
        if session.status != SessionStatus::Active {
            tracing::debug!(session_id, status = %session.status, "skipping retry");
            return Ok(());
        }

        tracing::debug!(session_id, deferred = session.deferred.len(), "retrying deferred steps");
        let mut replies = Vec::new();
        match self.drive(&mut session, &mut replies).await {
            Err(EngineError::SessionTerminal { .. }) => Ok(()),
            other => other,
        }
    }

    /// Re-arm retry timers for live sessions with deferred steps, e.g. after
    /// a restart on a persistent store. Returns the number of sessions
    /// scheduled.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let deferral = &self.inner.deferral;
        let mut scheduled = 0;
        for snapshot in self.inner.sessions.list_sessions().await? {
            if snapshot.status != SessionStatus::Active || snapshot.deferred.is_empty() {
                continue;
            }
            let Some(session) = self.inner.sessions.get_session(&snapshot.id).await? else {
                continue;
            };
            let delay = deferral.next_due(&session).unwrap_or_else(|| deferral.retry_delay());
            if deferral.schedule(&session.id, delay) {
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            tracing::info!(sessions = scheduled, "deferred retries recovered");
        }
        Ok(scheduled)
    }

    /// Run cycles until the session leaves `active` or has to wait on
    /// deferred steps. Caller holds the session lock.
    ///
    /// Fails with `SessionTerminal { status: Cancelled }` when the session
    /// was cancelled; nothing from the interrupted cycle is saved.
    async fn drive(&self, session: &mut Session, replies: &mut Vec<String>) -> Result<(), EngineError> {
        let token = self.inner.deferral.token(&session.id);
        if token.is_cancelled() {
            return Err(cancelled(session));
        }

        let max_cycles = self.inner.config.max_cycles_per_run;
        let mut cycles: u32 = 0;
        let mut waiting = false;
        let mut unsaved = true;

        while session.status == SessionStatus::Active {
            if session.frontier.is_empty() {
                self.complete(session);
                unsaved = true;
                break;
            }
            if cycles >= max_cycles {
                self.runaway(session, max_cycles);
                unsaved = true;
                break;
            }
            cycles += 1;

            let result = self.run_cycle(session, &token, replies).await?;
            if result == CycleResult::Cancelled || token.is_cancelled() {
                return Err(cancelled(session));
            }
            session.touch();
            self.inner.sessions.save_session(session).await?;
            unsaved = false;

            match result {
                CycleResult::Continue => continue,
                CycleResult::Waiting => {
                    waiting = true;
                    break;
                }
                _ => break,
            }
        }

        if unsaved {
            if token.is_cancelled() {
                return Err(cancelled(session));
            }
            session.touch();
            self.inner.sessions.save_session(session).await?;
        }

        if session.status.is_terminal() {
            self.release(&session.id);
        } else if waiting {
            let delay = self
                .inner
                .deferral
                .next_due(session)
                .unwrap_or_else(|| self.inner.deferral.retry_delay());
            self.inner.deferral.schedule(&session.id, delay);
        }
        Ok(())
    }

    /// One pass over the frontier.
    async fn run_cycle(
        &self,
        session: &mut Session,
        token: &CancellationToken,
        replies: &mut Vec<String>,
    ) -> Result<CycleResult, EngineError> {
        let deferral = &self.inner.deferral;
        let frontier = session.frontier.clone();
        let runnable: Vec<String> = frontier
            .iter()
            .filter(|id| deferral.is_ready(session, id))
            .cloned()
            .collect();
        if runnable.is_empty() {
            tracing::debug!(
                session_id = session.id.as_str(),
                deferred = frontier.len(),
                "no deferred step due yet"
            );
            return Ok(CycleResult::Waiting);
        }

        session.pass += 1;
        let pass = session.pass;
        tracing::debug!(
            session_id = session.id.as_str(),
            pass,
            runnable = ?runnable,
            "starting cycle"
        );

        // Execute against the state as of cycle start.
        let view = SessionView::new(session.clone());
        let mut outcomes: HashMap<String, StepOutcome> = HashMap::new();
        let mut paused_on: Option<String> = None;
        let mut unattempted: Vec<String> = Vec::new();
        let mut segment: Vec<StepDefinition> = Vec::new();

        let mut pending = runnable.iter();
        while let Some(step_id) = pending.next() {
            let Some(step) = self.inner.graph.get_step(step_id).await? else {
                outcomes.insert(
                    step_id.clone(),
                    StepOutcome::Failed(FunctionError::new(format!(
                        "step '{step_id}' not found in graph"
                    ))),
                );
                continue;
            };

            if self.inner.executor.kind_of(&step) != Some(FunctionKind::InputRequest) {
                segment.push(step);
                continue;
            }

            outcomes.extend(self.execute_segment(std::mem::take(&mut segment), &view).await);
            let outcome = self.inner.executor.execute(&step, &view).await;
            let asked = outcome.is_success();
            outcomes.insert(step.id.clone(), outcome);
            if asked {
                paused_on = Some(step.id);
                unattempted = pending.cloned().collect();
                break;
            }
        }
        if paused_on.is_none() {
            outcomes.extend(self.execute_segment(segment, &view).await);
        }

        if token.is_cancelled() {
            tracing::debug!(
                session_id = session.id.as_str(),
                pass,
                "session cancelled mid-cycle; discarding results"
            );
            return Ok(CycleResult::Cancelled);
        }

        // Barrier: commit every outcome in frontier order.
        let mut completed: Vec<String> = Vec::new();
        let mut fatal: Option<(String, String)> = None;
        for step_id in &runnable {
            let Some(outcome) = outcomes.remove(step_id) else {
                continue;
            };
            match &outcome {
                StepOutcome::Success { output, kind } => {
                    let cycle = self
                        .inner
                        .executor
                        .record(session, step_id, &outcome)
                        .unwrap_or_default();
                    deferral.clear(session, step_id);
                    self.emit_text(session, step_id, *kind, output, replies);
                    self.publish(EngineEvent::StepCompleted {
                        session_id: session.id.clone(),
                        step_id: step_id.clone(),
                        cycle,
                        pass,
                    });
                    if *kind != FunctionKind::InputRequest {
                        completed.push(step_id.clone());
                    }
                }
                StepOutcome::Unresolved { missing } => {
                    let attempts = deferral.defer(session, step_id, missing.clone());
                    self.publish(EngineEvent::StepDeferred {
                        session_id: session.id.clone(),
                        step_id: step_id.clone(),
                        missing: missing.clone(),
                        attempts,
                    });
                }
                StepOutcome::Failed(err) => {
                    self.inner.executor.record(session, step_id, &outcome);
                    deferral.clear(session, step_id);
                    self.publish(EngineEvent::StepFailed {
                        session_id: session.id.clone(),
                        step_id: step_id.clone(),
                        error: err.message.clone(),
                        recoverable: err.recoverable,
                    });
                    if err.recoverable {
                        tracing::warn!(
                            session_id = session.id.as_str(),
                            step_id = step_id.as_str(),
                            error = %err,
                            "recoverable step failure; step dropped for this cycle"
                        );
                    } else {
                        tracing::error!(
                            session_id = session.id.as_str(),
                            step_id = step_id.as_str(),
                            pass,
                            error = %err,
                            "step failed"
                        );
                        fatal.get_or_insert_with(|| (step_id.clone(), err.message.clone()));
                    }
                }
            }
        }

        // Transitions see every write of this cycle.
        let mut next: Vec<String> = Vec::new();
        for step_id in &completed {
            let transitions = self.inner.graph.outgoing_transitions(step_id).await?;
            for target in self.inner.evaluator.fired_targets(&transitions, session) {
                push_unique(&mut next, target);
            }
        }

        if let Some((step_id, message)) = fatal {
            let mut frontier = vec![step_id.clone()];
            for id in next {
                push_unique(&mut frontier, id);
            }
            session.frontier = frontier;
            session.status = SessionStatus::Error;
            self.publish(EngineEvent::SessionFailed {
                session_id: session.id.clone(),
                error: format!("step '{step_id}' failed: {message}"),
            });
            return Ok(CycleResult::Failed);
        }

        if let Some(ask) = paused_on {
            let mut carry = next;
            for id in &frontier {
                if session.deferred.contains_key(id) {
                    push_unique(&mut carry, id.clone());
                }
            }
            for id in unattempted {
                push_unique(&mut carry, id);
            }
            carry.retain(|id| *id != ask);

            let statement = session
                .latest_output(&ask)
                .and_then(|r| r.value.get("statement"))
                .map(value_to_string);
            tracing::info!(
                session_id = session.id.as_str(),
                step_id = ask.as_str(),
                carry_over = ?carry,
                "session awaiting input"
            );
            session.carry_over = carry;
            session.frontier = vec![ask.clone()];
            session.status = SessionStatus::AwaitingInput;
            self.publish(EngineEvent::SessionPaused {
                session_id: session.id.clone(),
                step_id: ask,
                statement,
            });
            return Ok(CycleResult::Paused);
        }

        for id in &frontier {
            if session.deferred.contains_key(id) {
                push_unique(&mut next, id.clone());
            }
        }
        session.frontier = next;

        if session.frontier.is_empty() {
            self.complete(session);
            return Ok(CycleResult::Completed);
        }
        Ok(CycleResult::Continue)
    }

    /// Run one segment of normal steps concurrently.
    async fn execute_segment(
        &self,
        segment: Vec<StepDefinition>,
        view: &SessionView,
    ) -> Vec<(String, StepOutcome)> {
        if segment.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_parallel_steps.max(1)));
        let step_ids: Vec<String> = segment.iter().map(|s| s.id.clone()).collect();
        let mut join_set = JoinSet::new();

        for step in segment {
            let executor = Arc::clone(&self.inner.executor);
            let semaphore = Arc::clone(&semaphore);
            let view = view.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = executor.execute(&step, &view).await;
                (step.id, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(step_ids.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => {
                    tracing::error!(session_id = view.id(), error = %e, "step task join error");
                }
            }
        }

        // A panicked task leaves its step without an outcome.
        for step_id in step_ids {
            if !outcomes.iter().any(|(id, _)| *id == step_id) {
                outcomes.push((
                    step_id,
                    StepOutcome::Failed(FunctionError::new("step task panicked")),
                ));
            }
        }
        outcomes
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn complete(&self, session: &mut Session) {
        session.frontier.clear();
        session.deferred.clear();
        session.status = SessionStatus::Completed;
        tracing::info!(
            session_id = session.id.as_str(),
            passes = session.pass,
            "session completed"
        );
        self.publish(EngineEvent::SessionCompleted {
            session_id: session.id.clone(),
            passes: session.pass,
        });
    }

    fn runaway(&self, session: &mut Session, max_cycles: u32) {
        let step_id = session.frontier.first().cloned().unwrap_or_default();
        let message = format!("exceeded {max_cycles} cycles in one run");
        session.record_error(&step_id, message.clone(), false);
        session.status = SessionStatus::Error;
        tracing::error!(
            session_id = session.id.as_str(),
            step_id = step_id.as_str(),
            max_cycles,
            "runaway loop stopped"
        );
        self.publish(EngineEvent::SessionFailed {
            session_id: session.id.clone(),
            error: message,
        });
    }

    /// Append reply and prompt text to the chat history.
    fn emit_text(
        &self,
        session: &mut Session,
        step_id: &str,
        kind: FunctionKind,
        output: &Value,
        replies: &mut Vec<String>,
    ) {
        let key = match kind {
            FunctionKind::ReplyEmission => "reply",
            FunctionKind::InputRequest => "statement",
            FunctionKind::Normal => return,
        };
        let text = match output {
            Value::String(s) => Some(s.clone()),
            other => other.get(key).map(value_to_string),
        };
        let Some(text) = text else {
            return;
        };
        session.push_message(ChatRole::Assistant, text.clone(), Some(step_id));
        if kind == FunctionKind::ReplyEmission {
            replies.push(text);
        }
    }

    async fn load(&self, session_id: &str) -> Result<Session, EngineError> {
        self.inner
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the session lock and load the session. On failure the lock
    /// entry is dropped again unless another caller holds it.
    async fn lock_and_load(&self, session_id: &str) -> Result<(OwnedMutexGuard<()>, Session), EngineError> {
        let guard = self.lock_for(session_id).lock_owned().await;
        match self.load(session_id).await {
            Ok(session) => Ok((guard, session)),
            Err(e) => {
                drop(guard);
                self.forget_lock(session_id);
                Err(e)
            }
        }
    }

    fn forget_lock(&self, session_id: &str) {
        self.inner
            .locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Drop runtime state of a session that became terminal.
    fn release(&self, session_id: &str) {
        self.inner.deferral.release(session_id);
        self.inner.locks.remove(session_id);
    }

    fn publish(&self, event: EngineEvent) {
        self.inner.event_bus.publish(event);
    }
}

/// Receives session ids from deferral timers and runs their retries.
async fn dispatch_retries<G, S>(
    inner: Weak<EngineInner<G, S>>,
    mut wake_rx: tokio::sync::mpsc::UnboundedReceiver<String>,
) where
    G: GraphRepository + 'static,
    S: SessionRepository + 'static,
{
    while let Some(session_id) = wake_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = WorkflowEngine { inner };
        tokio::spawn(async move {
            if let Err(e) = engine.retry_deferred(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "deferred retry failed");
            }
        });
    }
}

fn cancelled(session: &Session) -> EngineError {
    EngineError::SessionTerminal {
        id: session.id.clone(),
        status: SessionStatus::Cancelled,
    }
}

fn reject_terminal(session: &Session, cancelled: bool) -> Result<(), EngineError> {
    if cancelled {
        return Err(EngineError::SessionTerminal {
            id: session.id.clone(),
            status: SessionStatus::Cancelled,
        });
    }
    if session.status.is_terminal() {
        return Err(EngineError::SessionTerminal {
            id: session.id.clone(),
            status: session.status,
        });
    }
    Ok(())
}

/// Merge `text` into the newest output of `step_id` under `key`.
fn merge_reply(session: &mut Session, step_id: &str, key: &str, text: &str) {
    let reply = Value::String(text.to_string());
    match session.memory.get_mut(step_id).and_then(|records| records.last_mut()) {
        Some(record) => match &mut record.value {
            Value::Object(map) => {
                map.insert(key.to_string(), reply);
            }
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.take());
                map.insert(key.to_string(), reply);
                record.value = Value::Object(map);
            }
        },
        None => {
            let mut map = Map::new();
            map.insert(key.to_string(), reply);
            let pass = session.pass;
            session.append_output(step_id, Value::Object(map), pass);
        }
    }
}

fn statement_of(session: &Session) -> Option<String> {
    let ask = session.awaiting_step()?;
    session
        .latest_output(ask)?
        .value
        .get("statement")
        .map(value_to_string)
}

fn push_unique(list: &mut Vec<String>, id: String) {
    if !list.contains(&id) {
        list.push(id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_graph_yaml;
    use crate::workflow::resolver::VariableResolver;
    use serde_json::json;
    use threadline_types::graph::{TransitionDefinition, WorkflowGraph};

    struct TestGraph(WorkflowGraph);

    impl GraphRepository for TestGraph {
        async fn root_step_id(&self) -> Result<String, RepositoryError> {
            Ok(self.0.root.clone())
        }

        async fn get_step(&self, step_id: &str) -> Result<Option<StepDefinition>, RepositoryError> {
            Ok(self.0.step(step_id).cloned())
        }

        async fn outgoing_transitions(
            &self,
            source: &str,
        ) -> Result<Vec<TransitionDefinition>, RepositoryError> {
            Ok(self.0.outgoing(source).cloned().collect())
        }
    }

    #[derive(Default, Clone)]
    struct TestSessions(Arc<DashMap<String, Session>>);

    impl SessionRepository for TestSessions {
        async fn create_session(&self, session: &Session) -> Result<(), RepositoryError> {
            if self.0.contains_key(&session.id) {
                return Err(RepositoryError::Conflict(session.id.clone()));
            }
            self.0.insert(session.id.clone(), session.clone());
            Ok(())
        }

        async fn get_session(&self, id: &str) -> Result<Option<Session>, RepositoryError> {
            Ok(self.0.get(id).map(|s| s.clone()))
        }

        async fn save_session(&self, session: &Session) -> Result<(), RepositoryError> {
            self.0.insert(session.id.clone(), session.clone());
            Ok(())
        }

        async fn list_sessions(&self) -> Result<Vec<SessionSnapshot>, RepositoryError> {
            Ok(self.0.iter().map(|s| s.snapshot()).collect())
        }
    }

    type TestEngine = WorkflowEngine<TestGraph, TestSessions>;

    fn engine_with(yaml: &str, registry: FunctionRegistry, config: EngineConfig) -> TestEngine {
        engine_on(yaml, TestSessions::default(), registry, config)
    }

    fn engine_on(
        yaml: &str,
        sessions: TestSessions,
        registry: FunctionRegistry,
        config: EngineConfig,
    ) -> TestEngine {
        let graph = parse_graph_yaml(yaml).unwrap();
        WorkflowEngine::new(TestGraph(graph), sessions, registry, config, EventBus::new(256))
    }

    fn engine(yaml: &str) -> TestEngine {
        engine_with(yaml, FunctionRegistry::with_builtins(), EngineConfig::default())
    }

    async fn stored(engine: &TestEngine, id: &str) -> Session {
        engine.sessions().get_session(id).await.unwrap().unwrap()
    }

    const GREETING: &str = r#"
name: greeting
root: root
steps:
  - id: root
    function: data.set
  - id: ask
    function: request.request
    input:
      statement: "What is your name?"
  - id: greet
    function: reply.reply
    input:
      reply: "Hello, @{ask}.response"
transitions:
  - id: t1
    source: root
    target: ask
  - id: t2
    source: ask
    target: greet
"#;

    #[tokio::test]
    async fn test_ask_then_greet() {
        let engine = engine(GREETING);

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::AwaitingInput);
        assert!(response.awaiting_input);
        assert_eq!(response.statement.as_deref(), Some("What is your name?"));

        let snapshot = engine.snapshot("s1").await.unwrap();
        assert_eq!(snapshot.frontier, vec!["ask".to_string()]);

        let response = engine.resume("s1", "Ava").await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);
        assert_eq!(response.replies, vec!["Hello, Ava".to_string()]);
        assert!(response.error.is_none());

        let session = stored(&engine, "s1").await;
        assert!(session.frontier.is_empty());
        assert_eq!(
            session.latest_output("greet").unwrap().value,
            json!({"reply": "Hello, Ava"})
        );
        assert_eq!(
            session.latest_output("ask").unwrap().value,
            json!({"statement": "What is your name?", "response": "Ava"})
        );

        let history = engine.history("s1").await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["What is your name?", "Ava", "Hello, Ava"]);
        assert_eq!(history[1].role, ChatRole::User);
    }

    #[tokio::test]
    async fn test_rejections_do_not_mutate() {
        let engine = engine(GREETING);
        engine.start(Some("s1".to_string())).await.unwrap();
        let paused = stored(&engine, "s1").await;

        let err = engine.start(Some("s1".to_string())).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionExists(_)));
        assert_eq!(stored(&engine, "s1").await, paused);

        let err = engine.resume("missing", "hi").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));

        engine.resume("s1", "Ava").await.unwrap();
        let completed = stored(&engine, "s1").await;
        let err = engine.resume("s1", "again").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SessionTerminal {
                status: SessionStatus::Completed,
                ..
            }
        ));
        assert_eq!(stored(&engine, "s1").await, completed);
    }

    #[tokio::test]
    async fn test_resume_requires_awaiting_input() {
        let yaml = r#"
name: wait
root: root
steps:
  - id: root
    function: data.set
  - id: later
    function: data.set
    input:
      value: "@{never}.value"
transitions:
  - id: t1
    source: root
    target: later
"#;
        let engine = engine(yaml);
        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Active);
        assert!(response.has_pending_steps);

        let err = engine.resume("s1", "hello").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotAwaitingInput {
                status: SessionStatus::Active,
                ..
            }
        ));
        engine.cancel("s1").await.unwrap();
    }

    struct Sleepy {
        millis: u64,
        output: Value,
    }

    impl super::super::function::StepFunction for Sleepy {
        async fn call(
            &self,
            _view: &SessionView,
            _inputs: Map<String, Value>,
        ) -> Result<Value, FunctionError> {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(self.output.clone())
        }
    }

    #[tokio::test]
    async fn test_parallel_paths_join_after_deferral() {
        let yaml = r#"
name: analyze
root: root
steps:
  - id: root
    function: data.set
  - id: extract
    function: nlp.extract
  - id: sentiment
    function: nlp.sentiment
  - id: combine
    function: data.set
    input:
      text: "@{extract}.text"
      label: "@{sentiment}.label"
transitions:
  - id: t1
    source: root
    target: extract
  - id: t2
    source: root
    target: sentiment
  - id: t3
    source: root
    target: combine
"#;
        let mut registry = FunctionRegistry::with_builtins();
        registry.register(
            "nlp.extract",
            Sleepy {
                millis: 30,
                output: json!({"text": "great day"}),
            },
        );
        registry.register(
            "nlp.sentiment",
            Sleepy {
                millis: 10,
                output: json!({"label": "positive"}),
            },
        );
        let engine = engine_with(yaml, registry, EngineConfig::default());
        let mut events = engine.subscribe();

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);

        let session = stored(&engine, "s1").await;
        let combine = session.outputs("combine");
        assert_eq!(combine.len(), 1);
        assert_eq!(
            combine[0].value,
            json!({"text": "great day", "label": "positive"})
        );
        // Deferred in the cycle that ran extract and sentiment, run in the next.
        let extract_pass = session.latest_output("extract").unwrap().pass;
        assert_eq!(session.latest_output("sentiment").unwrap().pass, extract_pass);
        assert_eq!(combine[0].pass, extract_pass + 1);
        assert!(session.deferred.is_empty());

        let mut deferred = 0;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::StepDeferred { step_id, .. } = event {
                assert_eq!(step_id, "combine");
                deferred += 1;
            }
        }
        assert_eq!(deferred, 1);
    }

    #[tokio::test]
    async fn test_looped_step_keeps_each_cycle() {
        let yaml = r#"
name: loop
root: tick
steps:
  - id: tick
    function: test.increment
    input:
      current: "@{tick}.n|0"
  - id: done
    function: data.set
    input:
      total: "@{tick}.n"
transitions:
  - id: again
    source: tick
    target: tick
    conditions: ["@{tick}.n < 2"]
  - id: finish
    source: tick
    target: done
    conditions: ["@{tick}.n >= 2"]
"#;
        let mut registry = FunctionRegistry::with_builtins();
        registry.register_fn("test.increment", FunctionKind::Normal, |_, inputs| {
            let current = inputs.get("current").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({ "n": current + 1 }))
        });
        let engine = engine_with(yaml, registry, EngineConfig::default());

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);

        let session = stored(&engine, "s1").await;
        let ticks = session.outputs("tick");
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].cycle, 0);
        assert_eq!(ticks[1].cycle, 1);

        let resolver = VariableResolver::new(&session);
        assert_eq!(resolver.resolve("@{tick}.n"), (json!(2), true));
        assert_eq!(resolver.resolve("@{tick}.n,0"), (json!(1), true));
        assert_eq!(
            session.latest_output("done").unwrap().value,
            json!({"total": 2})
        );
    }

    #[tokio::test]
    async fn test_runaway_loop_is_stopped() {
        let yaml = r#"
name: forever
root: spin
steps:
  - id: spin
    function: data.set
transitions:
  - id: again
    source: spin
    target: spin
"#;
        let config = EngineConfig {
            max_cycles_per_run: 5,
            ..EngineConfig::default()
        };
        let engine = engine_with(yaml, FunctionRegistry::with_builtins(), config);

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Error);
        assert!(response.error.unwrap().contains("exceeded 5 cycles"));

        let session = stored(&engine, "s1").await;
        assert_eq!(session.outputs("spin").len(), 5);
        assert!(!session.frontier.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_failure_keeps_sibling_output() {
        let yaml = r#"
name: failing
root: root
steps:
  - id: root
    function: data.set
  - id: good
    function: data.set
    input:
      ok: true
  - id: bad
    function: test.explode
  - id: after
    function: data.set
transitions:
  - id: t1
    source: root
    target: good
  - id: t2
    source: root
    target: bad
  - id: t3
    source: good
    target: after
"#;
        let mut registry = FunctionRegistry::with_builtins();
        registry.register_fn("test.explode", FunctionKind::Normal, |_, _| {
            Err(FunctionError::new("boom"))
        });
        let engine = engine_with(yaml, registry, EngineConfig::default());

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Error);
        assert_eq!(response.error.as_deref(), Some("boom"));

        let session = stored(&engine, "s1").await;
        assert_eq!(session.latest_output("good").unwrap().value, json!({"ok": true}));
        assert!(session.outputs("after").is_empty());
        let error = session.last_error().unwrap();
        assert_eq!(error.step_id, "bad");
        assert_eq!(error.cycle, 0);

        let err = engine.advance("s1").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionTerminal { .. }));
    }

    #[tokio::test]
    async fn test_recoverable_failure_drops_step() {
        let yaml = r#"
name: flaky
root: root
steps:
  - id: root
    function: test.flaky
  - id: next
    function: data.set
transitions:
  - id: t1
    source: root
    target: next
"#;
        let mut registry = FunctionRegistry::with_builtins();
        registry.register_fn("test.flaky", FunctionKind::Normal, |_, _| {
            Err(FunctionError::recoverable("upstream busy"))
        });
        let engine = engine_with(yaml, registry, EngineConfig::default());

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);
        let session = stored(&engine, "s1").await;
        assert_eq!(session.errors.len(), 1);
        assert!(session.errors[0].recoverable);
        assert!(session.outputs("next").is_empty());
    }

    #[tokio::test]
    async fn test_pause_carries_over_parallel_branch() {
        let yaml = r#"
name: fanout
root: root
steps:
  - id: root
    function: data.set
  - id: ask
    function: request.request
    input:
      statement: "Topic?"
  - id: side
    function: data.set
    input:
      note: "side branch"
  - id: side_next
    function: data.set
  - id: answer
    function: reply.reply
    input:
      reply: "You said @{ask}.response"
transitions:
  - id: t1
    source: root
    target: side
  - id: t2
    source: root
    target: ask
  - id: t3
    source: side
    target: side_next
  - id: t4
    source: ask
    target: answer
"#;
        let engine = engine(yaml);
        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::AwaitingInput);

        let session = stored(&engine, "s1").await;
        assert_eq!(session.frontier, vec!["ask".to_string()]);
        assert!(session.latest_output("side").is_some());
        assert_eq!(session.carry_over, vec!["side_next".to_string()]);

        let response = engine.resume("s1", "rust").await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);
        assert_eq!(response.replies, vec!["You said rust".to_string()]);
        let session = stored(&engine, "s1").await;
        assert!(session.latest_output("side_next").is_some());
        assert!(session.carry_over.is_empty());
    }

    const STUCK: &str = r#"
name: stuck
root: root
steps:
  - id: root
    function: data.set
  - id: waiter
    function: data.set
    input:
      value: "@{never}.val"
transitions:
  - id: t1
    source: root
    target: waiter
"#;

    #[tokio::test]
    async fn test_background_retry_then_cancel_stops_writes() {
        let config = EngineConfig {
            retry_delay_ms: 10,
            ..EngineConfig::default()
        };
        let engine = engine_with(STUCK, FunctionRegistry::with_builtins(), config);

        let response = engine.start(Some("s1".to_string())).await.unwrap();
        assert_eq!(response.status, SessionStatus::Active);
        assert!(response.has_pending_steps);

        // Background retries keep re-deferring the step.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let session = stored(&engine, "s1").await;
        assert!(session.deferred["waiter"].attempts > 1);

        let response = engine.cancel("s1").await.unwrap();
        assert_eq!(response.status, SessionStatus::Cancelled);
        let at_cancel = stored(&engine, "s1").await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let later = stored(&engine, "s1").await;
        assert_eq!(later, at_cancel);
        assert_eq!(later.status, SessionStatus::Cancelled);
        assert!(later.outputs("waiter").is_empty());

        let err = engine.cancel("s1").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionTerminal { .. }));
    }

    #[tokio::test]
    async fn test_recover_rearms_retries_after_restart() {
        let config = EngineConfig {
            retry_delay_ms: 10,
            ..EngineConfig::default()
        };
        let store = TestSessions::default();

        let first = engine_on(STUCK, store.clone(), FunctionRegistry::with_builtins(), config.clone());
        first.start(Some("s1".to_string())).await.unwrap();
        drop(first);

        // Without a live engine nothing retries the stored session.
        let attempts = |store: &TestSessions| store.0.get("s1").unwrap().deferred["waiter"].attempts;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let before = attempts(&store);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(attempts(&store), before);

        let second = engine_on(STUCK, store.clone(), FunctionRegistry::with_builtins(), config);
        assert_eq!(second.recover().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let session = stored(&second, "s1").await;
        assert_eq!(session.status, SessionStatus::Active);
        assert!(session.deferred["waiter"].attempts > before);
    }

    #[tokio::test]
    async fn test_recover_skips_paused_and_terminal_sessions() {
        let engine = engine(GREETING);
        engine.start(Some("paused".to_string())).await.unwrap();
        engine.start(Some("done".to_string())).await.unwrap();
        engine.resume("done", "Ava").await.unwrap();
        assert_eq!(engine.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_leaves_no_lock_behind() {
        let engine = engine(GREETING);
        for i in 0..50 {
            let err = engine.resume(&format!("ghost-{i}"), "hi").await.unwrap_err();
            assert!(matches!(err, EngineError::SessionNotFound(_)));
            let err = engine.advance(&format!("ghost-{i}")).await.unwrap_err();
            assert!(matches!(err, EngineError::SessionNotFound(_)));
        }
        assert!(engine.inner.locks.is_empty());

        engine.start(Some("s1".to_string())).await.unwrap();
        let err = engine.start(Some("s1".to_string())).await.unwrap_err();
        assert!(matches!(err, EngineError::SessionExists(_)));

        let response = engine.resume("s1", "Ava").await.unwrap();
        assert_eq!(response.status, SessionStatus::Completed);
        assert!(engine.inner.locks.is_empty());
    }

    const SLOW: &str = r#"
name: slow
root: root
steps:
  - id: root
    function: data.set
  - id: work
    function: test.sleep
transitions:
  - id: t1
    source: root
    target: work
"#;

    #[tokio::test]
    async fn test_cancel_during_running_cycle_discards_output() {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register(
            "test.sleep",
            Sleepy {
                millis: 200,
                output: json!({"done": true}),
            },
        );
        let engine = engine_with(SLOW, registry, EngineConfig::default());

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.start(Some("s1".to_string())).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = engine.cancel("s1").await.unwrap();
        assert_eq!(response.status, SessionStatus::Cancelled);

        let err = running.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            EngineError::SessionTerminal {
                status: SessionStatus::Cancelled,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let session = stored(&engine, "s1").await;
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert!(session.outputs("work").is_empty());
        assert!(engine.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_step_runs_once_after_dependency() {
        let yaml = r#"
name: chain
root: root
steps:
  - id: root
    function: data.set
  - id: b
    function: test.slow_b
  - id: c
    function: data.set
    input:
      got: "@{b}.val"
transitions:
  - id: t1
    source: root
    target: b
  - id: t2
    source: root
    target: c
"#;
        let mut registry = FunctionRegistry::with_builtins();
        registry.register(
            "test.slow_b",
            Sleepy {
                millis: 5,
                output: json!({"val": 7}),
            },
        );
        let engine = engine_with(yaml, registry, EngineConfig::default());

        engine.start(Some("s1".to_string())).await.unwrap();
        let session = stored(&engine, "s1").await;
        let b = session.latest_output("b").unwrap();
        let c = session.outputs("c");
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].value, json!({"got": 7}));
        assert_eq!(c[0].pass, b.pass + 1);
    }

    #[tokio::test]
    async fn test_advance_on_paused_session_is_noop() {
        let engine = engine(GREETING);
        engine.start(Some("s1".to_string())).await.unwrap();
        let before = stored(&engine, "s1").await;

        let response = engine.advance("s1").await.unwrap();
        assert!(response.awaiting_input);
        assert_eq!(stored(&engine, "s1").await, before);
    }

    #[tokio::test]
    async fn test_generated_session_ids_are_unique() {
        let engine = engine(GREETING);
        let a = engine.start(None).await.unwrap();
        let b = engine.start(None).await.unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(engine.list_sessions().await.unwrap().len(), 2);
    }

    #[test]
    fn test_merge_reply_wraps_non_object_output() {
        let mut session = Session::new("s1", "ask");
        session.append_output("ask", json!("Name?"), 1);
        merge_reply(&mut session, "ask", "response", "Ava");
        assert_eq!(
            session.latest_output("ask").unwrap().value,
            json!({"value": "Name?", "response": "Ava"})
        );
    }
}

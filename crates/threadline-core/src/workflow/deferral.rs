//! Deferral manager: bookkeeping and background retry for steps whose
//! inputs did not resolve.
//!
//! Deferred entries live in `Session::deferred` so they persist with the
//! session. The manager owns the runtime side: one cancellation token per
//! session and at most one pending retry timer per session. A timer never
//! touches the session itself; when it fires it sends the session id on the
//! wake channel and the engine runs the retry under the session lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use threadline_types::session::{DeferredStep, Session};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::resolver::VariableResolver;

/// Default minimum delay between retries of a deferred step.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

pub struct DeferralManager {
    retry_delay: Duration,
    /// Cancellation tokens keyed by session id.
    tokens: DashMap<String, CancellationToken>,
    /// Sessions with a pending retry timer.
    scheduled: Arc<DashSet<String>>,
    wake_tx: mpsc::UnboundedSender<String>,
}

impl DeferralManager {
    /// Create a manager and the receiving end of its wake channel.
    pub fn new(retry_delay: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let manager = Self {
            retry_delay,
            tokens: DashMap::new(),
            scheduled: Arc::new(DashSet::new()),
            wake_tx,
        };
        (manager, wake_rx)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    // -----------------------------------------------------------------------
    // Session-side bookkeeping
    // -----------------------------------------------------------------------

    /// Record an unresolved attempt of `step_id`. Returns the attempt count.
    ///
    /// The missing set is replaced, not merged: dependencies can change as
    /// other steps complete.
    pub fn defer(&self, session: &mut Session, step_id: &str, missing: Vec<String>) -> u32 {
        let now = Utc::now();
        let next_attempt_at = now
            + chrono::Duration::from_std(self.retry_delay).unwrap_or(chrono::Duration::zero());

        let entry = session
            .deferred
            .entry(step_id.to_string())
            .or_insert_with(|| DeferredStep {
                missing: Vec::new(),
                attempts: 0,
                deferred_at: now,
                next_attempt_at,
            });
        entry.attempts += 1;
        entry.missing = missing;
        entry.next_attempt_at = next_attempt_at;

        tracing::warn!(
            session_id = session.id.as_str(),
            step_id,
            attempts = entry.attempts,
            missing = ?entry.missing,
            "step deferred on unresolved inputs"
        );
        entry.attempts
    }

    /// Drop the deferral entry of a step that ran (or failed) this cycle.
    pub fn clear(&self, session: &mut Session, step_id: &str) -> bool {
        session.deferred.remove(step_id).is_some()
    }

    /// Whether `step_id` may be attempted now.
    ///
    /// Steps that are not deferred are always ready. Deferred steps are
    /// ready once every missing reference resolves or the retry deadline
    /// has passed.
    pub fn is_ready(&self, session: &Session, step_id: &str) -> bool {
        let Some(entry) = session.deferred.get(step_id) else {
            return true;
        };
        if Utc::now() >= entry.next_attempt_at {
            return true;
        }
        let resolver = VariableResolver::new(session);
        entry
            .missing
            .iter()
            .all(|reference| resolver.resolve_expression(reference).is_resolved())
    }

    /// Deferred steps of `session` that may be attempted now.
    pub fn retry_ready(&self, session: &Session) -> Vec<String> {
        session
            .deferred
            .keys()
            .filter(|step_id| self.is_ready(session, step_id))
            .cloned()
            .collect()
    }

    /// Time until the earliest deferral deadline, if anything is deferred.
    pub fn next_due(&self, session: &Session) -> Option<Duration> {
        let now = Utc::now();
        session
            .deferred
            .values()
            .map(|entry| (entry.next_attempt_at - now).to_std().unwrap_or(Duration::ZERO))
            .min()
    }

    // -----------------------------------------------------------------------
    // Runtime side: tokens and timers
    // -----------------------------------------------------------------------

    /// The session's cancellation token, created on first use.
    pub fn token(&self, session_id: &str) -> CancellationToken {
        self.tokens
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    pub fn is_cancelled(&self, session_id: &str) -> bool {
        self.tokens
            .get(session_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Trip the session's token. Pending timers exit without firing and
    /// in-flight cycles discard their results.
    ///
    /// The token stays registered until [`release`](Self::release) so that
    /// late retries still observe the cancellation.
    pub fn cancel(&self, session_id: &str) {
        self.token(session_id).cancel();
        tracing::debug!(session_id, "deferral retries cancelled");
    }

    /// Forget a session that reached a terminal status.
    pub fn release(&self, session_id: &str) {
        if let Some((_, token)) = self.tokens.remove(session_id) {
            token.cancel();
        }
        self.scheduled.remove(session_id);
    }

    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.scheduled.contains(session_id)
    }

    /// Arm a retry timer for `session_id` firing after `delay`.
    ///
    /// Returns false when the session is cancelled or already has a timer.
    pub fn schedule(&self, session_id: &str, delay: Duration) -> bool {
        let token = self.token(session_id);
        if token.is_cancelled() {
            return false;
        }
        if !self.scheduled.insert(session_id.to_string()) {
            return false;
        }

        let scheduled = Arc::clone(&self.scheduled);
        let wake_tx = self.wake_tx.clone();
        let id = session_id.to_string();
        tracing::debug!(session_id, delay_ms = delay.as_millis() as u64, "retry scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    scheduled.remove(&id);
                }
                _ = tokio::time::sleep(delay) => {
                    scheduled.remove(&id);
                    if !token.is_cancelled() {
                        let _ = wake_tx.send(id);
                    }
                }
            }
        });
        true
    }
}

impl std::fmt::Debug for DeferralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferralManager")
            .field("retry_delay", &self.retry_delay)
            .field("sessions", &self.tokens.len())
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(delay_ms: u64) -> (DeferralManager, mpsc::UnboundedReceiver<String>) {
        DeferralManager::new(Duration::from_millis(delay_ms))
    }

    #[test]
    fn test_defer_counts_attempts_and_replaces_missing() {
        let (deferral, _rx) = manager(500);
        let mut session = Session::new("s1", "combine");

        let attempts = deferral.defer(&mut session, "combine", vec!["@{extract}.text".into()]);
        assert_eq!(attempts, 1);

        let attempts = deferral.defer(&mut session, "combine", vec!["@{sentiment}.label".into()]);
        assert_eq!(attempts, 2);

        let entry = &session.deferred["combine"];
        assert_eq!(entry.missing, vec!["@{sentiment}.label".to_string()]);
        assert!(entry.next_attempt_at > entry.deferred_at);
    }

    #[test]
    fn test_ready_when_missing_references_resolve() {
        let (deferral, _rx) = manager(60_000);
        let mut session = Session::new("s1", "c");
        deferral.defer(&mut session, "c", vec!["@{b}.val".into()]);

        assert!(!deferral.is_ready(&session, "c"));
        assert!(deferral.retry_ready(&session).is_empty());

        session.append_output("b", json!({"val": 1}), 1);
        assert!(deferral.is_ready(&session, "c"));
        assert_eq!(deferral.retry_ready(&session), vec!["c".to_string()]);
    }

    #[test]
    fn test_ready_when_deadline_passed() {
        let (deferral, _rx) = manager(0);
        let mut session = Session::new("s1", "c");
        deferral.defer(&mut session, "c", vec!["@{b}.val".into()]);
        assert!(deferral.is_ready(&session, "c"));
        assert_eq!(deferral.next_due(&session), Some(Duration::ZERO));
    }

    #[test]
    fn test_undeferred_step_is_ready_and_clear_removes_entry() {
        let (deferral, _rx) = manager(500);
        let mut session = Session::new("s1", "c");
        assert!(deferral.is_ready(&session, "c"));
        assert!(deferral.next_due(&session).is_none());

        deferral.defer(&mut session, "c", vec!["@{b}.val".into()]);
        assert!(deferral.clear(&mut session, "c"));
        assert!(!deferral.clear(&mut session, "c"));
    }

    #[tokio::test]
    async fn test_schedule_wakes_once() {
        let (deferral, mut rx) = manager(10);
        assert!(deferral.schedule("s1", Duration::from_millis(10)));
        assert!(!deferral.schedule("s1", Duration::from_millis(10)));
        assert!(deferral.is_scheduled("s1"));

        let woken = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(woken.as_deref(), Some("s1"));
        assert!(!deferral.is_scheduled("s1"));
    }

    #[tokio::test]
    async fn test_cancel_stops_pending_timer() {
        let (deferral, mut rx) = manager(10);
        assert!(deferral.schedule("s1", Duration::from_millis(50)));
        deferral.cancel("s1");
        assert!(deferral.is_cancelled("s1"));
        assert!(!deferral.schedule("s1", Duration::from_millis(1)));

        let woken = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(woken.is_err(), "cancelled timer must not fire");
    }

    #[tokio::test]
    async fn test_release_forgets_session() {
        let (deferral, _rx) = manager(10);
        let token = deferral.token("s1");
        deferral.release("s1");
        assert!(token.is_cancelled());
        assert!(!deferral.is_cancelled("s1"));
    }
}

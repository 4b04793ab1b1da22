//! Event types for the Threadline engine event bus.
//!
//! `EngineEvent` is broadcast as sessions move through their lifecycle.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

/// Events emitted while the engine drives sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new session was created at the graph root.
    SessionStarted { session_id: String, root: String },

    /// A step ran and its output was recorded.
    StepCompleted {
        session_id: String,
        step_id: String,
        cycle: usize,
        pass: u64,
    },

    /// A step's inputs did not resolve; it waits for a retry.
    StepDeferred {
        session_id: String,
        step_id: String,
        missing: Vec<String>,
        attempts: u32,
    },

    /// A step's function failed.
    StepFailed {
        session_id: String,
        step_id: String,
        error: String,
        recoverable: bool,
    },

    /// The session paused on an input-request step.
    SessionPaused {
        session_id: String,
        step_id: String,
        statement: Option<String>,
    },

    /// Human input arrived and the session is active again.
    SessionResumed { session_id: String, step_id: String },

    /// The frontier drained.
    SessionCompleted { session_id: String, passes: u64 },

    /// A non-recoverable error stopped the session.
    SessionFailed { session_id: String, error: String },

    /// The session was cancelled by a caller.
    SessionCancelled { session_id: String },
}

impl EngineEvent {
    pub fn session_id(&self) -> &str {
        match self {
            EngineEvent::SessionStarted { session_id, .. }
            | EngineEvent::StepCompleted { session_id, .. }
            | EngineEvent::StepDeferred { session_id, .. }
            | EngineEvent::StepFailed { session_id, .. }
            | EngineEvent::SessionPaused { session_id, .. }
            | EngineEvent::SessionResumed { session_id, .. }
            | EngineEvent::SessionCompleted { session_id, .. }
            | EngineEvent::SessionFailed { session_id, .. }
            | EngineEvent::SessionCancelled { session_id } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_tagged() {
        let event = EngineEvent::StepDeferred {
            session_id: "s1".to_string(),
            step_id: "combine".to_string(),
            missing: vec!["@{extract}.text".to_string()],
            attempts: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_deferred");
        assert_eq!(json["step_id"], "combine");

        let back: EngineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.session_id(), "s1");
    }
}

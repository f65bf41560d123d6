//! Orchestrator state machine and the per-session in-flight registry.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::phase::Phase;

/// Lifecycle of a [`PhaseOrchestrator`](super::PhaseOrchestrator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum OrchestratorState {
    Uninitialized,
    Loaded,
    PhaseRunning(Phase),
    /// The gate rejected this phase's output. Re-run it or abandon.
    PhaseBlocked(Phase),
    Completed,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Loaded => write!(f, "loaded"),
            Self::PhaseRunning(p) => write!(f, "running {}", p),
            Self::PhaseBlocked(p) => write!(f, "blocked at {}", p),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Set of session ids with a phase currently executing.
///
/// Shared by every orchestrator in the process; entries are held through an
/// [`InFlightGuard`] so they are cleared on every exit path, including a
/// dropped future.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    sessions: Arc<Mutex<HashSet<String>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `session_id`. Returns `None` if a phase is already running for it.
    pub fn try_claim(&self, session_id: &str) -> Option<InFlightGuard> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if !sessions.insert(session_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the session's in-flight claim on drop.
pub struct InFlightGuard {
    registry: InFlightRegistry,
    session_id: String,
}

impl InFlightGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
    }
}

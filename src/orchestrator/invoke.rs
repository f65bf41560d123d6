//! Request-level phase invocation: load, execute, gate, save.
//!
//! When execution succeeds but the save fails, the updated session is kept
//! as a pending save so the caller can retry persistence without re-running
//! the (possibly expensive) phase.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{OrchestratorState, PhaseOrchestrator, PhaseOutcome, Pipeline};
use crate::errors::OrchestratorError;
use crate::gate::GateDecision;
use crate::phase::Phase;
use crate::session::{PhaseResult, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Completed,
    Blocked,
}

/// Response body of a successful phase invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseInvocation {
    pub status: InvocationStatus,
    pub session_id: String,
    pub result: PhaseResult,
    pub review: GateDecision,
    pub next_phase: Option<Phase>,
    pub can_proceed: bool,
}

impl PhaseInvocation {
    fn from_outcome(session_id: String, outcome: PhaseOutcome) -> Self {
        Self {
            status: if outcome.review.approved {
                InvocationStatus::Completed
            } else {
                InvocationStatus::Blocked
            },
            session_id,
            result: outcome.result,
            review: outcome.review,
            next_phase: outcome.next_phase,
            can_proceed: outcome.can_proceed,
        }
    }
}

/// Drives whole invocations against a shared [`Pipeline`].
pub struct PhaseService {
    pipeline: Pipeline,
    pending_saves: Mutex<HashMap<String, Session>>,
}

impl PhaseService {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            pending_saves: Mutex::new(HashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    async fn pending_for(&self, session_id: &str, user_id: &str) -> Option<Session> {
        self.pending_saves
            .lock()
            .await
            .get(session_id)
            .filter(|s| s.user_id == user_id)
            .cloned()
    }

    pub async fn has_pending_save(&self, session_id: &str) -> bool {
        self.pending_saves.lock().await.contains_key(session_id)
    }

    /// Run `phase` for a session end to end.
    ///
    /// The session's single-flight claim is taken before loading and held
    /// through the save, so concurrent invocations never overwrite each
    /// other's results. A session with an unsaved previous invocation
    /// continues from that in-memory state rather than the stale stored copy.
    pub async fn invoke(
        &self,
        session_id: &str,
        user_id: &str,
        phase: Phase,
        input: Value,
    ) -> Result<PhaseInvocation, OrchestratorError> {
        let mut orch = self.pipeline.orchestrator();
        orch.claim(session_id)?;
        match self.pending_for(session_id, user_id).await {
            Some(pending) => {
                tracing::debug!(session_id, "resuming from unsaved session state");
                orch.resume(pending);
            }
            None => {
                orch.load_session(session_id, user_id).await?;
            }
        }

        let outcome = match orch.execute_phase(phase, input).await {
            Ok(outcome) => outcome,
            Err(failure) if orch.state() == OrchestratorState::Failed => {
                return Err(self.record_failure(&mut orch, session_id, failure).await);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = orch.save_session().await {
            self.keep_pending(&mut orch, session_id).await;
            return Err(e);
        }
        self.pending_saves.lock().await.remove(session_id);

        Ok(PhaseInvocation::from_outcome(session_id.to_string(), outcome))
    }

    /// Persist the `failed` status left by an execution fault. A save
    /// failure is reported alongside the fault and kept as a pending save.
    async fn record_failure(
        &self,
        orch: &mut PhaseOrchestrator,
        session_id: &str,
        failure: OrchestratorError,
    ) -> OrchestratorError {
        match orch.save_session().await {
            Ok(()) => {
                self.pending_saves.lock().await.remove(session_id);
                failure
            }
            Err(persistence) => {
                self.keep_pending(orch, session_id).await;
                OrchestratorError::FailureNotSaved {
                    failure: Box::new(failure),
                    persistence: Box::new(persistence),
                }
            }
        }
    }

    async fn keep_pending(&self, orch: &mut PhaseOrchestrator, session_id: &str) {
        if let Some(session) = orch.take_session() {
            self.pending_saves
                .lock()
                .await
                .insert(session_id.to_string(), session);
        }
    }

    /// Persist a session whose earlier save failed.
    pub async fn retry_save(&self, session_id: &str, user_id: &str) -> Result<Session, OrchestratorError> {
        let mut orch = self.pipeline.orchestrator();
        orch.claim(session_id)?;
        let session = self
            .pending_for(session_id, user_id)
            .await
            .ok_or_else(|| OrchestratorError::NotFound {
                session_id: session_id.to_string(),
            })?;

        orch.resume(session);
        orch.save_session().await?;

        self.pending_saves.lock().await.remove(session_id);
        tracing::info!(session_id, "pending session save completed");
        orch.into_session().ok_or(OrchestratorError::NotLoaded)
    }
}

//! Phase orchestration.
//!
//! [`Pipeline`] bundles the process-wide collaborators (session store,
//! quality gate, progress hub, work units) and is built once at startup.
//! A [`PhaseOrchestrator`] is created per request from the pipeline and
//! drives one session through its phases:
//!
//! ```text
//! Uninitialized --load--> Loaded --execute--> PhaseRunning(p)
//!     PhaseRunning(p) --gate approves, p last--> Completed
//!     PhaseRunning(p) --gate approves---------> Loaded
//!     PhaseRunning(p) --gate rejects----------> PhaseBlocked(p)
//!     PhaseRunning(p) --fault/timeout---------> Failed
//! ```
//!
//! Only one phase may run per session at a time across the whole process;
//! this is enforced by the pipeline's [`InFlightRegistry`], not by a global
//! lock, so unrelated sessions run fully concurrently. A caller that also
//! loads and saves the session takes the claim up front with
//! [`PhaseOrchestrator::claim`] so the whole load-execute-save cycle is
//! serialized.

pub mod invoke;
pub mod state;
pub mod workers;

pub use invoke::{InvocationStatus, PhaseInvocation, PhaseService};
pub use state::{InFlightGuard, InFlightRegistry, OrchestratorState};
pub use workers::{PhaseContext, PhaseOutput, PhaseWorker, WorkerRegistry};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use crate::errors::{OrchestratorError, StoreError};
use crate::gate::{GateDecision, QualityGate};
use crate::phase::Phase;
use crate::progress::{EventType, ProgressHub, ProgressSink};
use crate::session::store::SessionStore;
use crate::session::{PhaseRecord, PhaseResult, Session, SessionStatus};

/// Execution policy.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Overall deadline for one phase's work unit.
    pub phase_timeout: Duration,
    /// Whether an already-approved phase may be executed again.
    pub allow_rerun_approved: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(600),
            allow_rerun_approved: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    pub fn with_allow_rerun_approved(mut self, allow: bool) -> Self {
        self.allow_rerun_approved = allow;
        self
    }
}

/// Process-wide dependencies shared by every orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn SessionStore>,
    gate: Arc<QualityGate>,
    hub: Arc<ProgressHub>,
    workers: WorkerRegistry,
    config: OrchestratorConfig,
    in_flight: InFlightRegistry,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gate: Arc<QualityGate>,
        hub: Arc<ProgressHub>,
        workers: WorkerRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            gate,
            hub,
            workers,
            config,
            in_flight: InFlightRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn gate(&self) -> &Arc<QualityGate> {
        &self.gate
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn in_flight(&self) -> &InFlightRegistry {
        &self.in_flight
    }

    /// A fresh orchestrator bound to this pipeline.
    pub fn orchestrator(&self) -> PhaseOrchestrator {
        PhaseOrchestrator::new(self.clone())
    }
}

/// Result of one gated phase execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseOutcome {
    pub result: PhaseResult,
    pub review: GateDecision,
    pub next_phase: Option<Phase>,
    /// Approved and there is a phase after this one.
    pub can_proceed: bool,
}

/// Session-scoped phase state machine.
pub struct PhaseOrchestrator {
    pipeline: Pipeline,
    session: Option<Session>,
    state: OrchestratorState,
    claim: Option<InFlightGuard>,
}

impl PhaseOrchestrator {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            session: None,
            state: OrchestratorState::Uninitialized,
            claim: None,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn into_session(self) -> Option<Session> {
        self.session
    }

    /// Detach the in-memory session while keeping any held claim.
    pub fn take_session(&mut self) -> Option<Session> {
        self.state = OrchestratorState::Uninitialized;
        self.session.take()
    }

    /// Take the single-flight claim for `session_id` and hold it until this
    /// orchestrator is dropped. Claim before loading so the loaded copy
    /// cannot be overwritten by a concurrent invocation.
    pub fn claim(&mut self, session_id: &str) -> Result<(), OrchestratorError> {
        if self.holds_claim(session_id) {
            return Ok(());
        }
        self.claim = Some(self.try_claim(session_id)?);
        Ok(())
    }

    fn holds_claim(&self, session_id: &str) -> bool {
        self.claim
            .as_ref()
            .is_some_and(|guard| guard.session_id() == session_id)
    }

    fn try_claim(&self, session_id: &str) -> Result<InFlightGuard, OrchestratorError> {
        self.pipeline.in_flight.try_claim(session_id).ok_or_else(|| {
            tracing::warn!(session_id, "rejected concurrent phase execution");
            OrchestratorError::PhaseInProgress {
                session_id: session_id.to_string(),
            }
        })
    }

    fn loaded(&self) -> Result<&Session, OrchestratorError> {
        self.session.as_ref().ok_or(OrchestratorError::NotLoaded)
    }

    fn loaded_mut(&mut self) -> Result<&mut Session, OrchestratorError> {
        self.session.as_mut().ok_or(OrchestratorError::NotLoaded)
    }

    /// Hydrate the session from the repository. Sessions owned by another
    /// user are reported as `NotFound`.
    pub async fn load_session(
        &mut self,
        session_id: &str,
        user_id: &str,
    ) -> Result<&Session, OrchestratorError> {
        let session = self
            .pipeline
            .store
            .get_session(session_id, user_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { session_id } => OrchestratorError::NotFound { session_id },
                other => OrchestratorError::Load {
                    session_id: session_id.to_string(),
                    source: other.into(),
                },
            })?;
        tracing::debug!(session_id, phase = %session.phase, status = %session.status, "session loaded");
        Ok(self.resume(session))
    }

    /// Adopt an in-memory session without touching the repository.
    pub fn resume(&mut self, session: Session) -> &Session {
        self.state = OrchestratorState::Loaded;
        self.session.insert(session)
    }

    /// Store a result produced upstream without running the gate. The
    /// record stays unapproved until [`review_phase`](Self::review_phase).
    pub fn set_phase_result(&mut self, result: PhaseResult) -> Result<(), OrchestratorError> {
        let session = self.loaded_mut()?;
        tracing::debug!(session_id = %session.id, phase = %result.phase, "phase result set without review");
        session.apply_record(PhaseRecord::unreviewed(result));
        Ok(())
    }

    /// Run the gate against the stored result of `phase`.
    pub fn review_phase(&mut self, phase: Phase) -> Result<PhaseOutcome, OrchestratorError> {
        let session = self.loaded()?;
        let result = session
            .result(phase)
            .cloned()
            .ok_or(OrchestratorError::NoResult { phase })?;
        let session_id = session.id.clone();

        let review = self
            .pipeline
            .gate
            .evaluate_result(&result)
            .map_err(|source| OrchestratorError::GateEvaluation { phase, source })?;
        self.loaded_mut()?.set_review(phase, review.clone());
        self.apply_decision(phase, &review);
        self.publish_decision(&session_id, phase, &review);
        Ok(self.outcome(result, review))
    }

    /// Execute `phase` under the single-flight and predecessor rules, then
    /// gate its output. Every earlier phase must be approved. The session is
    /// updated in memory only; call [`save_session`](Self::save_session) to
    /// persist.
    pub async fn execute_phase(
        &mut self,
        phase: Phase,
        input: Value,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let session = self.loaded()?.clone();
        let session_id = session.id.clone();

        let _scoped_claim = if self.holds_claim(&session_id) {
            None
        } else {
            Some(self.try_claim(&session_id)?)
        };

        if let Some(predecessor) = Phase::ALL
            .into_iter()
            .take_while(|p| *p < phase)
            .find(|p| !session.is_approved(*p))
        {
            let reason = match session.record(predecessor) {
                Some(PhaseRecord {
                    review: Some(review),
                    ..
                }) => review.reason.clone(),
                Some(_) => "result has not been reviewed".to_string(),
                None => "no result".to_string(),
            };
            tracing::info!(session_id = %session_id, %phase, %predecessor, "phase blocked");
            return Err(OrchestratorError::PhaseBlocked {
                phase,
                predecessor,
                reason,
            });
        }

        if !self.pipeline.config.allow_rerun_approved && session.is_approved(phase) {
            return Err(OrchestratorError::PhaseAlreadyApproved { phase });
        }

        let worker = self
            .pipeline
            .workers
            .get(phase)
            .ok_or(OrchestratorError::NoWorker { phase })?;

        self.state = OrchestratorState::PhaseRunning(phase);
        let hub = Arc::clone(&self.pipeline.hub);
        hub.publish(
            &session_id,
            EventType::Progress,
            json!({"stage": "phase_started", "phase": phase}),
        );
        tracing::info!(session_id = %session_id, %phase, "phase started");

        let ctx = PhaseContext {
            prior: phase
                .predecessor()
                .and_then(|p| session.result(p).cloned()),
            progress: ProgressSink::new(Arc::clone(&hub), session_id.clone(), phase),
            input,
            session,
        };

        let deadline = self.pipeline.config.phase_timeout;
        let output = match tokio::time::timeout(deadline, worker.run(ctx)).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(self.fail(&session_id, OrchestratorError::PhaseExecution { phase, source }));
            }
            Err(_) => {
                return Err(self.fail(&session_id, OrchestratorError::PhaseTimeout { phase, deadline }));
            }
        };

        let result = PhaseResult::new(phase, output.data, output.metadata);
        let review = match self.pipeline.gate.evaluate_result(&result) {
            Ok(review) => review,
            Err(source) => {
                self.loaded_mut()?
                    .apply_record(PhaseRecord::unreviewed(result));
                return Err(self.fail(&session_id, OrchestratorError::GateEvaluation { phase, source }));
            }
        };

        self.loaded_mut()?
            .apply_record(PhaseRecord::reviewed(result.clone(), review.clone()));
        self.apply_decision(phase, &review);
        self.publish_decision(&session_id, phase, &review);
        Ok(self.outcome(result, review))
    }

    /// Persist the in-memory session. Failures are reported as
    /// `Persistence`, distinct from execution failures.
    pub async fn save_session(&mut self) -> Result<(), OrchestratorError> {
        let session = self.session.as_mut().ok_or(OrchestratorError::NotLoaded)?;
        session.touch();
        let session_id = session.id.clone();
        self.pipeline
            .store
            .save(session)
            .await
            .map_err(|e| {
                tracing::error!(session_id = %session_id, error = %e, "session save failed");
                OrchestratorError::Persistence {
                    session_id: session_id.clone(),
                    source: e.into(),
                }
            })?;
        tracing::debug!(session_id = %session_id, "session saved");
        Ok(())
    }

    fn apply_decision(&mut self, phase: Phase, review: &GateDecision) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !review.approved {
            session.phase = phase;
            session.status = SessionStatus::Blocked;
            self.state = OrchestratorState::PhaseBlocked(phase);
        } else if let Some(next) = phase.next() {
            session.phase = next;
            session.status = SessionStatus::Active;
            self.state = OrchestratorState::Loaded;
        } else {
            session.phase = phase;
            session.status = SessionStatus::Completed;
            self.state = OrchestratorState::Completed;
        }
        session.touch();
        tracing::info!(
            session_id = %session.id,
            %phase,
            score = review.score,
            approved = review.approved,
            status = %session.status,
            "gate decision applied"
        );
    }

    fn publish_decision(&self, session_id: &str, phase: Phase, review: &GateDecision) {
        let hub = &self.pipeline.hub;
        hub.publish(
            session_id,
            EventType::Progress,
            json!({
                "stage": "gate_evaluated",
                "phase": phase,
                "approved": review.approved,
                "score": review.score,
                "reason": review.reason,
            }),
        );
        hub.mark_ended(session_id);
    }

    fn fail(&mut self, session_id: &str, err: OrchestratorError) -> OrchestratorError {
        self.state = OrchestratorState::Failed;
        if let Some(session) = self.session.as_mut() {
            session.status = SessionStatus::Failed;
            session.touch();
        }
        tracing::error!(session_id, stage = err.stage(), error = %err, "phase failed");
        let hub = &self.pipeline.hub;
        hub.publish(
            session_id,
            EventType::Error,
            json!({"stage": err.stage(), "code": err.code(), "message": err.to_string()}),
        );
        hub.mark_ended(session_id);
        err
    }

    fn outcome(&self, result: PhaseResult, review: GateDecision) -> PhaseOutcome {
        let next_phase = result.phase.next();
        PhaseOutcome {
            can_proceed: review.approved && next_phase.is_some(),
            next_phase,
            result,
            review,
        }
    }
}

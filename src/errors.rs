//! Typed error hierarchy for the dossier pipeline.
//!
//! Each subsystem exposes its own enum:
//! - `StoreError`: session repository failures
//! - `GateError`: quality-gate scorer failures
//! - `EngineError`: a single scraping-engine instance failing
//! - `PoolError`: scraper pool resource failures
//! - `LlmError`: the LLM call layer
//! - `OrchestratorError`: everything the phase orchestrator reports to callers

use std::time::Duration;

use thiserror::Error;

use crate::phase::Phase;

/// Errors from the session repository.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error("Invalid session request: {0}")]
    InvalidInput(String),

    #[error("Session storage failure: {0}")]
    Persistence(#[source] anyhow::Error),
}

/// Errors raised while scoring a phase output.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Scorer failed for phase {phase}: {message}")]
    Scorer { phase: Phase, message: String },

    #[error("Scorer panicked while evaluating phase {phase}")]
    Panicked { phase: Phase },
}

/// Errors from one scraping-engine instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine launch failed: {0}")]
    Launch(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Engine API error (status {status}): {message}")]
    Api { status: u16, message: String },
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Network(err.to_string())
    }
}

/// Errors from the scraper pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timed out after {waited:?} waiting for a free scraper")]
    AcquireTimeout { waited: Duration },

    #[error("Scraper pool is exhausted or shut down")]
    PoolExhausted,

    #[error("Failed to launch scraping engine after {attempts} attempts: {source}")]
    EngineLaunch {
        attempts: u32,
        #[source]
        source: EngineError,
    },

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the LLM call layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM endpoint is not configured")]
    NotConfigured,

    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("LLM returned an unusable response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Request(err.to_string())
    }
}

/// Errors surfaced by the phase orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error("No session loaded")]
    NotLoaded,

    #[error("Failed to load session {session_id}: {source:#}")]
    Load {
        session_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Phase {phase} is blocked: {predecessor} has not been approved ({reason})")]
    PhaseBlocked {
        phase: Phase,
        predecessor: Phase,
        reason: String,
    },

    #[error("A phase is already running for session {session_id}")]
    PhaseInProgress { session_id: String },

    #[error("Phase {phase} is already approved and re-runs are disabled")]
    PhaseAlreadyApproved { phase: Phase },

    #[error("No work unit registered for phase {phase}")]
    NoWorker { phase: Phase },

    #[error("No result recorded for phase {phase}")]
    NoResult { phase: Phase },

    #[error("Phase {phase} failed: {source:#}")]
    PhaseExecution {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("Phase {phase} exceeded its {deadline:?} deadline")]
    PhaseTimeout { phase: Phase, deadline: Duration },

    #[error("Quality gate failed for phase {phase}: {source}")]
    GateEvaluation {
        phase: Phase,
        #[source]
        source: GateError,
    },

    #[error("Failed to persist session {session_id}: {source:#}")]
    Persistence {
        session_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// A phase faulted and the resulting `failed` status could not be saved.
    #[error("{failure} (failed status was not saved: {persistence})")]
    FailureNotSaved {
        failure: Box<OrchestratorError>,
        persistence: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    /// The pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::NotLoaded | Self::Load { .. } => "load",
            Self::PhaseBlocked { .. }
            | Self::PhaseInProgress { .. }
            | Self::PhaseAlreadyApproved { .. }
            | Self::NoWorker { .. }
            | Self::PhaseExecution { .. }
            | Self::PhaseTimeout { .. } => "execute",
            Self::NoResult { .. } | Self::GateEvaluation { .. } => "gate",
            Self::Persistence { .. } => "persist",
            Self::FailureNotSaved { failure, .. } => failure.stage(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NotLoaded => "not_loaded",
            Self::Load { .. } => "load_error",
            Self::PhaseBlocked { .. } => "phase_blocked",
            Self::PhaseInProgress { .. } => "phase_in_progress",
            Self::PhaseAlreadyApproved { .. } => "phase_already_approved",
            Self::NoWorker { .. } => "no_worker",
            Self::NoResult { .. } => "no_result",
            Self::PhaseExecution { .. } => "phase_execution_error",
            Self::PhaseTimeout { .. } => "phase_timeout",
            Self::GateEvaluation { .. } => "gate_evaluation_error",
            Self::Persistence { .. } => "persistence_error",
            Self::FailureNotSaved { failure, .. } => failure.code(),
        }
    }

    /// Separate an execution failure from a save failure that came with it.
    pub fn split_unsaved(self) -> (OrchestratorError, Option<OrchestratorError>) {
        match self {
            Self::FailureNotSaved {
                failure,
                persistence,
            } => (*failure, Some(*persistence)),
            other => (other, None),
        }
    }
}

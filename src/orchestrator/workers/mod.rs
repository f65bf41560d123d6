//! Phase work units.
//!
//! Each phase has one [`PhaseWorker`]. Workers are opaque to the
//! orchestrator: they receive a snapshot of the session, the prior phase's
//! result and caller input, and return data plus metadata that the quality
//! gate then judges.

mod extraction;
mod html;
mod llm_units;

pub use extraction::{ExtractionSettings, ExtractionWorker};
pub use html::{PageSummary, summarize_page};
pub use llm_units::{EnrichmentWorker, GenerationWorker};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::phase::Phase;
use crate::progress::ProgressSink;
use crate::session::{PhaseResult, Session};

/// Everything a work unit may look at.
pub struct PhaseContext {
    pub session: Session,
    /// Result of the immediately preceding phase, when there is one.
    pub prior: Option<PhaseResult>,
    /// Caller-supplied, phase-specific input. `Value::Null` when absent.
    pub input: Value,
    pub progress: ProgressSink,
}

/// What a work unit hands back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub data: Value,
    pub metadata: Map<String, Value>,
}

/// A pluggable operation keyed by phase.
///
/// Real implementations: [`ExtractionWorker`], [`EnrichmentWorker`],
/// [`GenerationWorker`]. Tests register their own doubles.
#[async_trait]
pub trait PhaseWorker: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(&self, ctx: PhaseContext) -> Result<PhaseOutput>;
}

/// Phase → worker lookup shared by every orchestrator.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<Phase, Arc<dyn PhaseWorker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker under the phase it reports, replacing any previous one.
    pub fn with(mut self, worker: Arc<dyn PhaseWorker>) -> Self {
        self.register(worker);
        self
    }

    pub fn register(&mut self, worker: Arc<dyn PhaseWorker>) {
        self.workers.insert(worker.phase(), worker);
    }

    pub fn get(&self, phase: Phase) -> Option<Arc<dyn PhaseWorker>> {
        self.workers.get(&phase).cloned()
    }

    pub fn phases(&self) -> Vec<Phase> {
        let mut phases: Vec<Phase> = self.workers.keys().copied().collect();
        phases.sort();
        phases
    }
}

//! Session data model.
//!
//! A [`Session`] is the unit of pipeline state for one user + domain inquiry.
//! It is mutated only by the phase orchestrator and persisted through a
//! [`store::SessionStore`].

pub mod store;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gate::GateDecision;
use crate::phase::Phase;

pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore};

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+$")
        .expect("valid domain regex")
});

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    /// The last executed phase was rejected by its quality gate.
    Blocked,
    /// The final phase has been approved.
    Completed,
    /// The last execution faulted.
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Blocked => "blocked",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Output of one phase execution. Immutable once created; a re-run
/// produces a new result that supersedes this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: Phase,
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl PhaseResult {
    pub fn new(phase: Phase, data: Value, metadata: Map<String, Value>) -> Self {
        Self {
            phase,
            data,
            metadata,
            timestamp: Utc::now(),
        }
    }
}

/// A phase result together with the gate decision that judged it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub result: PhaseResult,
    /// `None` until a quality-gate evaluation ran against `result`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<GateDecision>,
}

impl PhaseRecord {
    pub fn unreviewed(result: PhaseResult) -> Self {
        Self {
            result,
            review: None,
        }
    }

    pub fn reviewed(result: PhaseResult, review: GateDecision) -> Self {
        Self {
            result,
            review: Some(review),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.review.as_ref().is_some_and(|r| r.approved)
    }
}

/// Pipeline state for one user + domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    /// Normalized domain (see [`normalize_domain`]).
    pub domain: String,
    /// Pointer into the phase sequence: the phase to run next, or the final
    /// phase once the session is completed.
    pub phase: Phase,
    pub status: SessionStatus,
    /// Cross-phase knowledge base keyed by phase name.
    #[serde(default)]
    pub merged_data: Map<String, Value>,
    #[serde(default)]
    pub phase_results: BTreeMap<Phase, PhaseRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session. `domain` must already be normalized.
    pub fn new(user_id: &str, domain: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            domain: domain.to_string(),
            phase: Phase::Extraction,
            status: SessionStatus::Active,
            merged_data: Map::new(),
            phase_results: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phase_results.get(&phase)
    }

    pub fn result(&self, phase: Phase) -> Option<&PhaseResult> {
        self.record(phase).map(|r| &r.result)
    }

    pub fn is_approved(&self, phase: Phase) -> bool {
        self.record(phase).is_some_and(PhaseRecord::is_approved)
    }

    /// Store a record, superseding any previous record for the same phase,
    /// and fold its data into the merged knowledge base. A record that is
    /// not approved revokes the reviews of every later phase.
    pub fn apply_record(&mut self, record: PhaseRecord) {
        let phase = record.result.phase;
        let approved = record.is_approved();
        self.merged_data
            .insert(phase.as_str().to_string(), record.result.data.clone());
        self.phase_results.insert(phase, record);
        if !approved {
            self.revoke_after(phase);
        }
        self.touch();
    }

    /// Attach a gate decision to the stored result of `phase`. A rejection
    /// revokes the reviews of every later phase.
    pub fn set_review(&mut self, phase: Phase, review: GateDecision) -> bool {
        let Some(record) = self.phase_results.get_mut(&phase) else {
            return false;
        };
        let approved = review.approved;
        record.review = Some(review);
        if !approved {
            self.revoke_after(phase);
        }
        self.touch();
        true
    }

    /// Clear the gate decisions of phases after `phase`. Their results are
    /// kept but count as unreviewed until gated again.
    fn revoke_after(&mut self, phase: Phase) {
        for (_, record) in self.phase_results.iter_mut().filter(|(p, _)| **p > phase) {
            record.review = None;
        }
    }

    /// The first phase that has not been approved yet.
    pub fn next_unapproved_phase(&self) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| !self.is_approved(*p))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Normalize a user-supplied domain: trim, lowercase, strip scheme,
/// credentials, `www.`, port, path, query and trailing dot.
pub fn normalize_domain(input: &str) -> Result<String> {
    let mut s = input.trim().to_lowercase();

    if let Some(idx) = s.find("://") {
        s = s[idx + 3..].to_string();
    }
    if let Some(end) = s.find(['/', '?', '#']) {
        s.truncate(end);
    }
    if let Some(at) = s.rfind('@') {
        s = s[at + 1..].to_string();
    }
    if let Some(colon) = s.find(':') {
        s.truncate(colon);
    }
    let s = s.trim_end_matches('.');
    let s = s.strip_prefix("www.").unwrap_or(s);

    if !DOMAIN_RE.is_match(s) {
        anyhow::bail!("Invalid domain '{}'", input.trim());
    }
    Ok(s.to_string())
}

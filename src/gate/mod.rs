//! Quality gate evaluated after every phase.
//!
//! [`QualityGate::evaluate`] is a pure function of its inputs: it never
//! reads the clock, random state, or the session. The approval threshold and
//! the scoring weights are per-phase configuration ([`GateRule`]); the
//! scoring formula itself is pluggable through the [`Scorer`] trait.
//!
//! ## Example
//!
//! ```
//! use dossier::gate::{GateConfig, QualityGate};
//! use dossier::phase::Phase;
//! use serde_json::{Map, json};
//!
//! let gate = QualityGate::new(GateConfig::default());
//! let data = json!({"pages": [], "title": "", "description": ""});
//! let decision = gate
//!     .evaluate(Phase::Extraction, &data, &Map::new(), chrono::Utc::now())
//!     .unwrap();
//! assert!(!decision.approved);
//! ```

pub mod scoring;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::GateError;
use crate::phase::Phase;
use crate::session::PhaseResult;

pub use scoring::FieldCoverageScorer;

/// Outcome of one gate evaluation. Never persisted on its own; it is stored
/// next to the result it judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub approved: bool,
    /// 0-100.
    pub score: u8,
    pub reason: String,
}

/// Everything a scorer may look at.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub phase: Phase,
    pub data: &'a Value,
    pub metadata: &'a Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Raw scorer output before the threshold is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    /// 0.0-100.0; values outside the range are clamped.
    pub score: f64,
    /// Short human-readable observations, e.g. missing fields.
    pub notes: Vec<String>,
}

/// Pluggable scoring formula.
pub trait Scorer: Send + Sync {
    fn score(&self, input: &GateInput<'_>, rule: &GateRule) -> Result<ScoreCard, String>;
}

/// One weighted field check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldWeight {
    /// Dot-separated path into the phase data (`company.name`).
    pub path: String,
    pub weight: f64,
    /// Minimum size: string length, array length or numeric value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
}

impl FieldWeight {
    pub fn new(path: &str, weight: f64) -> Self {
        Self {
            path: path.to_string(),
            weight,
            min: None,
        }
    }

    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }
}

/// Per-phase gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateRule {
    /// Minimum score (inclusive) for approval.
    pub threshold: u8,
    #[serde(default)]
    pub fields: Vec<FieldWeight>,
}

impl GateRule {
    pub fn new(threshold: u8, fields: Vec<FieldWeight>) -> Self {
        Self { threshold, fields }
    }
}

/// Gate rules for every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    #[serde(default = "default_extraction_rule")]
    pub extraction: GateRule,
    #[serde(default = "default_enrichment_rule")]
    pub enrichment: GateRule,
    #[serde(default = "default_generation_rule")]
    pub generation: GateRule,
}

fn default_extraction_rule() -> GateRule {
    GateRule::new(
        60,
        vec![
            FieldWeight::new("pages", 4.0).with_min(2.0),
            FieldWeight::new("title", 2.0),
            FieldWeight::new("description", 2.0),
            FieldWeight::new("total_words", 2.0).with_min(200.0),
        ],
    )
}

fn default_enrichment_rule() -> GateRule {
    GateRule::new(
        70,
        vec![
            FieldWeight::new("company_name", 2.0),
            FieldWeight::new("summary", 3.0).with_min(50.0),
            FieldWeight::new("industry", 1.0),
            FieldWeight::new("products", 2.0).with_min(1.0),
            FieldWeight::new("competitors", 1.0),
            FieldWeight::new("key_people", 1.0),
        ],
    )
}

fn default_generation_rule() -> GateRule {
    GateRule::new(
        70,
        vec![
            FieldWeight::new("documents", 5.0).with_min(1.0),
            FieldWeight::new("executive_summary", 3.0).with_min(100.0),
        ],
    )
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            extraction: default_extraction_rule(),
            enrichment: default_enrichment_rule(),
            generation: default_generation_rule(),
        }
    }
}

impl GateConfig {
    pub fn rule(&self, phase: Phase) -> &GateRule {
        match phase {
            Phase::Extraction => &self.extraction,
            Phase::Enrichment => &self.enrichment,
            Phase::Generation => &self.generation,
        }
    }

    pub fn rule_mut(&mut self, phase: Phase) -> &mut GateRule {
        match phase {
            Phase::Extraction => &mut self.extraction,
            Phase::Enrichment => &mut self.enrichment,
            Phase::Generation => &mut self.generation,
        }
    }

    /// Problems that make the configuration unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for phase in Phase::ALL {
            let rule = self.rule(phase);
            if rule.threshold > 100 {
                errors.push(format!(
                    "gates.{}.threshold must be 0-100, got {}",
                    phase, rule.threshold
                ));
            }
            for field in &rule.fields {
                if !(field.weight.is_finite() && field.weight > 0.0) {
                    errors.push(format!(
                        "gates.{}: weight for '{}' must be positive",
                        phase, field.path
                    ));
                }
                if field.path.trim().is_empty() {
                    errors.push(format!("gates.{}: empty field path", phase));
                }
            }
        }
        errors
    }
}

/// Deterministic evaluator for phase output.
#[derive(Clone)]
pub struct QualityGate {
    config: GateConfig,
    scorer: Arc<dyn Scorer>,
}

impl std::fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QualityGate {
    /// Gate using the weighted field-coverage scorer.
    pub fn new(config: GateConfig) -> Self {
        Self::with_scorer(config, Arc::new(FieldCoverageScorer))
    }

    pub fn with_scorer(config: GateConfig, scorer: Arc<dyn Scorer>) -> Self {
        Self { config, scorer }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Score one phase output and decide whether it unlocks the next phase.
    ///
    /// Empty or missing data always scores 0 and is rejected. Scorer errors
    /// and panics are reported as [`GateError`] instead of unwinding into the
    /// caller.
    pub fn evaluate(
        &self,
        phase: Phase,
        data: &Value,
        metadata: &Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<GateDecision, GateError> {
        let rule = self.config.rule(phase);

        if scoring::is_empty(data) {
            return Ok(GateDecision {
                approved: false,
                score: 0,
                reason: format!("{} produced no data", phase),
            });
        }

        let input = GateInput {
            phase,
            data,
            metadata,
            timestamp,
        };
        let card = catch_unwind(AssertUnwindSafe(|| self.scorer.score(&input, rule)))
            .map_err(|_| GateError::Panicked { phase })?
            .map_err(|message| GateError::Scorer { phase, message })?;

        let score = if card.score.is_nan() {
            0
        } else {
            card.score.clamp(0.0, 100.0).round() as u8
        };
        let approved = score >= rule.threshold;
        let mut reason = if approved {
            format!("score {} meets threshold {}", score, rule.threshold)
        } else {
            format!("score {} below threshold {}", score, rule.threshold)
        };
        if !card.notes.is_empty() {
            reason.push_str(": ");
            reason.push_str(&card.notes.join("; "));
        }

        Ok(GateDecision {
            approved,
            score,
            reason,
        })
    }

    /// Evaluate using only the fields of a stored result.
    pub fn evaluate_result(&self, result: &PhaseResult) -> Result<GateDecision, GateError> {
        self.evaluate(result.phase, &result.data, &result.metadata, result.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedScorer(f64);

    impl Scorer for FixedScorer {
        fn score(&self, _input: &GateInput<'_>, _rule: &GateRule) -> Result<ScoreCard, String> {
            Ok(ScoreCard {
                score: self.0,
                notes: Vec::new(),
            })
        }
    }

    struct PanickingScorer;

    impl Scorer for PanickingScorer {
        fn score(&self, _input: &GateInput<'_>, _rule: &GateRule) -> Result<ScoreCard, String> {
            panic!("scorer bug")
        }
    }

    struct FailingScorer;

    impl Scorer for FailingScorer {
        fn score(&self, _input: &GateInput<'_>, _rule: &GateRule) -> Result<ScoreCard, String> {
            Err("rubric unavailable".into())
        }
    }

    fn good_extraction() -> Value {
        json!({
            "title": "Acme Corp",
            "description": "Industrial widgets",
            "pages": [{"url": "https://acme.test/"}, {"url": "https://acme.test/about"}],
            "total_words": 1500
        })
    }

    #[test]
    fn test_empty_data_scores_zero_and_fails() {
        let gate = QualityGate::new(GateConfig::default());
        for data in [Value::Null, json!({}), json!([]), json!("  ")] {
            let d = gate
                .evaluate(Phase::Extraction, &data, &Map::new(), Utc::now())
                .unwrap();
            assert!(!d.approved);
            assert_eq!(d.score, 0);
        }
    }

    #[test]
    fn test_complete_extraction_is_approved() {
        let gate = QualityGate::new(GateConfig::default());
        let d = gate
            .evaluate(Phase::Extraction, &good_extraction(), &Map::new(), Utc::now())
            .unwrap();
        assert!(d.approved, "{:?}", d);
        assert_eq!(d.score, 100);
    }

    #[test]
    fn test_partial_extraction_reports_missing_fields() {
        let gate = QualityGate::new(GateConfig::default());
        let data = json!({"title": "Acme", "pages": [{"url": "x"}], "total_words": 20});
        let d = gate
            .evaluate(Phase::Extraction, &data, &Map::new(), Utc::now())
            .unwrap();
        assert!(!d.approved);
        assert_eq!(d.score, 20);
        assert!(d.reason.contains("description"));
        assert!(d.reason.contains("pages"));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let gate = QualityGate::new(GateConfig::default());
        let data = good_extraction();
        let meta = Map::new();
        let ts = Utc::now();
        let a = gate.evaluate(Phase::Extraction, &data, &meta, ts).unwrap();
        let b = gate.evaluate(Phase::Extraction, &data, &meta, ts).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_threshold_is_inclusive_and_per_phase() {
        let mut config = GateConfig::default();
        config.rule_mut(Phase::Enrichment).threshold = 85;
        let gate = QualityGate::with_scorer(config, Arc::new(FixedScorer(85.0)));
        let data = json!({"x": 1});
        let enrich = gate
            .evaluate(Phase::Enrichment, &data, &Map::new(), Utc::now())
            .unwrap();
        assert!(enrich.approved);

        let gate = QualityGate::with_scorer(GateConfig::default(), Arc::new(FixedScorer(40.0)));
        let extract = gate
            .evaluate(Phase::Extraction, &data, &Map::new(), Utc::now())
            .unwrap();
        assert!(!extract.approved);
        assert_eq!(extract.score, 40);
    }

    #[test]
    fn test_out_of_range_scores_are_clamped() {
        let gate = QualityGate::with_scorer(GateConfig::default(), Arc::new(FixedScorer(250.0)));
        let d = gate
            .evaluate(Phase::Generation, &json!({"x": 1}), &Map::new(), Utc::now())
            .unwrap();
        assert_eq!(d.score, 100);

        let gate = QualityGate::with_scorer(GateConfig::default(), Arc::new(FixedScorer(f64::NAN)));
        let d = gate
            .evaluate(Phase::Generation, &json!({"x": 1}), &Map::new(), Utc::now())
            .unwrap();
        assert_eq!(d.score, 0);
    }

    #[test]
    fn test_scorer_panic_is_caught() {
        let gate = QualityGate::with_scorer(GateConfig::default(), Arc::new(PanickingScorer));
        let err = gate
            .evaluate(Phase::Enrichment, &json!({"x": 1}), &Map::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, GateError::Panicked { phase: Phase::Enrichment }));
    }

    #[test]
    fn test_scorer_error_is_reported() {
        let gate = QualityGate::with_scorer(GateConfig::default(), Arc::new(FailingScorer));
        let err = gate
            .evaluate(Phase::Extraction, &json!({"x": 1}), &Map::new(), Utc::now())
            .unwrap_err();
        assert!(err.to_string().contains("rubric unavailable"));
    }

    #[test]
    fn test_validate_flags_bad_rules() {
        let mut config = GateConfig::default();
        config.rule_mut(Phase::Generation).threshold = 140;
        config
            .rule_mut(Phase::Extraction)
            .fields
            .push(FieldWeight::new("pages", 0.0));
        let errors = config.validate();
        assert_eq!(errors.len(), 2);
        assert!(GateConfig::default().validate().is_empty());
    }

    #[test]
    fn test_gate_config_rejects_unknown_fields() {
        let toml_src = r#"
            [extraction]
            threshold = 50
            weight = 3
        "#;
        assert!(toml::from_str::<GateConfig>(toml_src).is_err());
    }
}

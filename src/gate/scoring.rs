//! Weighted field-coverage scoring.
//!
//! Each [`FieldWeight`] contributes its weight when the value at its path is
//! present and large enough; the score is the satisfied share of the total
//! weight, scaled to 0-100.

use serde_json::Value;

use super::{FieldWeight, GateInput, GateRule, ScoreCard, Scorer};

/// Default scorer: weighted presence of configured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldCoverageScorer;

impl Scorer for FieldCoverageScorer {
    fn score(&self, input: &GateInput<'_>, rule: &GateRule) -> Result<ScoreCard, String> {
        if rule.fields.is_empty() {
            return Ok(ScoreCard {
                score: 100.0,
                notes: Vec::new(),
            });
        }

        let total: f64 = rule.fields.iter().map(|f| f.weight.max(0.0)).sum();
        if total <= 0.0 {
            return Err(format!("no positive weights configured for {}", input.phase));
        }

        let mut earned = 0.0;
        let mut notes = Vec::new();
        for field in &rule.fields {
            match lookup(input.data, &field.path) {
                Some(value) if satisfies(value, field) => earned += field.weight.max(0.0),
                Some(_) => notes.push(match field.min {
                    Some(min) => format!("'{}' below minimum {}", field.path, min),
                    None => format!("'{}' is empty", field.path),
                }),
                None => notes.push(format!("'{}' missing", field.path)),
            }
        }

        Ok(ScoreCard {
            score: earned / total * 100.0,
            notes,
        })
    }
}

/// Resolve a dot-separated path. Numeric segments index into arrays.
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|seg| !seg.is_empty())
        .try_fold(data, |current, seg| match current {
            Value::Object(map) => map.get(seg),
            Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Whether a value carries no information.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn measure(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Some(s.trim().chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        Value::Object(map) => Some(map.len() as f64),
        Value::Number(n) => n.as_f64(),
        Value::Bool(_) | Value::Null => None,
    }
}

fn satisfies(value: &Value, field: &FieldWeight) -> bool {
    if is_empty(value) {
        return false;
    }
    match field.min {
        Some(min) => measure(value).is_some_and(|m| m >= min),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use chrono::Utc;
    use serde_json::{Map, json};

    fn score(data: &Value, rule: &GateRule) -> ScoreCard {
        let meta = Map::new();
        let input = GateInput {
            phase: Phase::Enrichment,
            data,
            metadata: &meta,
            timestamp: Utc::now(),
        };
        FieldCoverageScorer.score(&input, rule).unwrap()
    }

    #[test]
    fn test_lookup_nested_paths_and_indices() {
        let data = json!({"company": {"name": "Acme", "people": [{"name": "Ada"}]}});
        assert_eq!(lookup(&data, "company.name"), Some(&json!("Acme")));
        assert_eq!(lookup(&data, "company.people.0.name"), Some(&json!("Ada")));
        assert_eq!(lookup(&data, "company.people.3"), None);
        assert_eq!(lookup(&data, "company.name.first"), None);
    }

    #[test]
    fn test_weights_are_proportional() {
        let rule = GateRule::new(
            50,
            vec![FieldWeight::new("a", 3.0), FieldWeight::new("b", 1.0)],
        );
        let card = score(&json!({"a": "x"}), &rule);
        assert!((card.score - 75.0).abs() < f64::EPSILON);
        assert_eq!(card.notes, vec!["'b' missing".to_string()]);
    }

    #[test]
    fn test_min_applies_to_strings_arrays_and_numbers() {
        let rule = GateRule::new(
            50,
            vec![
                FieldWeight::new("s", 1.0).with_min(5.0),
                FieldWeight::new("a", 1.0).with_min(2.0),
                FieldWeight::new("n", 1.0).with_min(10.0),
            ],
        );
        let card = score(&json!({"s": "hello", "a": [1], "n": 12}), &rule);
        assert!((card.score - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(card.notes.len(), 1);
        assert!(card.notes[0].contains("'a'"));
    }

    #[test]
    fn test_booleans_and_zero_count_as_present_without_min() {
        let rule = GateRule::new(
            50,
            vec![FieldWeight::new("flag", 1.0), FieldWeight::new("count", 1.0)],
        );
        let card = score(&json!({"flag": false, "count": 0}), &rule);
        assert!((card.score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_fields_means_full_score() {
        let card = score(&json!({"anything": 1}), &GateRule::new(70, Vec::new()));
        assert!((card.score - 100.0).abs() < f64::EPSILON);
    }
}

//! Phase sequence for the intelligence pipeline.
//!
//! Phases run strictly in order: extraction gates enrichment, enrichment
//! gates generation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Scrape the domain for evidence.
    Extraction,
    /// LLM enrichment of the extracted evidence.
    Enrichment,
    /// Document generation from the enriched knowledge base.
    Generation,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 3] = [Phase::Extraction, Phase::Enrichment, Phase::Generation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extraction => "extraction",
            Phase::Enrichment => "enrichment",
            Phase::Generation => "generation",
        }
    }

    /// Zero-based position in the phase sequence.
    pub fn ordinal(&self) -> usize {
        match self {
            Phase::Extraction => 0,
            Phase::Enrichment => 1,
            Phase::Generation => 2,
        }
    }

    pub fn from_ordinal(ordinal: usize) -> Option<Phase> {
        Self::ALL.get(ordinal).copied()
    }

    /// The phase whose approval unlocks this one.
    pub fn predecessor(&self) -> Option<Phase> {
        self.ordinal().checked_sub(1).and_then(Self::from_ordinal)
    }

    pub fn next(&self) -> Option<Phase> {
        Self::from_ordinal(self.ordinal() + 1)
    }

    pub fn is_first(&self) -> bool {
        self.predecessor().is_none()
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "extraction" | "extract" => Ok(Phase::Extraction),
            "enrichment" | "enrich" => Ok(Phase::Enrichment),
            "generation" | "generate" => Ok(Phase::Generation),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: extraction, enrichment, generation",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order() {
        assert_eq!(Phase::Extraction.next(), Some(Phase::Enrichment));
        assert_eq!(Phase::Enrichment.next(), Some(Phase::Generation));
        assert_eq!(Phase::Generation.next(), None);
        assert!(Phase::Extraction < Phase::Generation);
    }

    #[test]
    fn test_predecessor() {
        assert_eq!(Phase::Extraction.predecessor(), None);
        assert_eq!(Phase::Enrichment.predecessor(), Some(Phase::Extraction));
        assert_eq!(Phase::Generation.predecessor(), Some(Phase::Enrichment));
        assert!(Phase::Extraction.is_first());
        assert!(Phase::Generation.is_last());
    }

    #[test]
    fn test_parse_accepts_aliases_and_case() {
        assert_eq!("Extraction".parse::<Phase>().unwrap(), Phase::Extraction);
        assert_eq!(" enrich ".parse::<Phase>().unwrap(), Phase::Enrichment);
        assert_eq!("generate".parse::<Phase>().unwrap(), Phase::Generation);
        assert!("publishing".parse::<Phase>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Phase::Enrichment).unwrap();
        assert_eq!(json, "\"enrichment\"");
        let back: Phase = serde_json::from_str("\"generation\"").unwrap();
        assert_eq!(back, Phase::Generation);
    }
}

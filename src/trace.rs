//! Core trace data model: one record per inference invocation.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollectorError;

/// Classification of the nature of a query. Seven fixed tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Spectrum {
    Identity,
    Financial,
    MultiField,
    Context,
    Scaling,
    Edge,
    Communication,
}

impl Spectrum {
    /// All seven spectrums, in canonical order.
    pub const ALL: [Spectrum; 7] = [
        Spectrum::Identity,
        Spectrum::Financial,
        Spectrum::MultiField,
        Spectrum::Context,
        Spectrum::Scaling,
        Spectrum::Edge,
        Spectrum::Communication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Spectrum::Identity => "identity",
            Spectrum::Financial => "financial",
            Spectrum::MultiField => "multi-field",
            Spectrum::Context => "context",
            Spectrum::Scaling => "scaling",
            Spectrum::Edge => "edge",
            Spectrum::Communication => "communication",
        }
    }
}

impl std::fmt::Display for Spectrum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Spectrum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" => Ok(Spectrum::Identity),
            "financial" => Ok(Spectrum::Financial),
            "multi-field" | "multi_field" | "multifield" => Ok(Spectrum::MultiField),
            "context" => Ok(Spectrum::Context),
            "scaling" => Ok(Spectrum::Scaling),
            "edge" => Ok(Spectrum::Edge),
            "communication" => Ok(Spectrum::Communication),
            other => Err(format!("unknown spectrum '{other}'")),
        }
    }
}

/// One inference invocation as observed by the gateway.
///
/// Produced by the chat gateway at request finalization, ingested by the
/// quality collector, and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: Uuid,
    pub session: String,
    pub model: String,
    pub spectrum: Spectrum,
    pub latency_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl TraceRecord {
    /// Create a trace for a completed invocation.
    ///
    /// `total_tokens` is derived, keeping the token-accounting invariant
    /// true by construction at the producer.
    pub fn new(
        session: impl Into<String>,
        model: impl Into<String>,
        spectrum: Spectrum,
        latency_ms: u64,
        input_tokens: u32,
        output_tokens: u32,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            session: session.into(),
            model: model.into(),
            spectrum,
            latency_ms,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            error: None,
            feedback_score: None,
            created_at: Utc::now(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_feedback(mut self, score: f64) -> Self {
        self.feedback_score = Some(score);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Validate the record's shape invariants.
    ///
    /// Deserialized traces may carry an inconsistent `total_tokens` or an
    /// out-of-range feedback score; both reject at ingest.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.total_tokens != self.input_tokens + self.output_tokens {
            return Err(CollectorError::TokenMismatch {
                total: self.total_tokens,
                input: self.input_tokens,
                output: self.output_tokens,
            });
        }
        if let Some(score) = self.feedback_score
            && !(0.0..=1.0).contains(&score)
        {
            return Err(CollectorError::ScoreOutOfRange {
                score: format!("{score}"),
            });
        }
        if self.model.is_empty() {
            return Err(CollectorError::Malformed {
                reason: "empty model".to_string(),
            });
        }
        Ok(())
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spectrum_round_trips_through_str() {
        for spectrum in Spectrum::ALL {
            let parsed: Spectrum = spectrum.as_str().parse().unwrap();
            assert_eq!(parsed, spectrum);
        }
    }

    #[test]
    fn spectrum_accepts_underscore_variant() {
        assert_eq!(
            "multi_field".parse::<Spectrum>().unwrap(),
            Spectrum::MultiField
        );
    }

    #[test]
    fn spectrum_rejects_unknown() {
        assert!("galaxy".parse::<Spectrum>().is_err());
    }

    #[test]
    fn spectrum_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Spectrum::MultiField).unwrap();
        assert_eq!(json, "\"multi-field\"");
    }

    #[test]
    fn new_trace_satisfies_token_invariant() {
        let trace = TraceRecord::new("s1", "gpt-4o-mini", Spectrum::Identity, 120, 10, 25);
        assert_eq!(trace.total_tokens, 35);
        trace.validate().unwrap();
    }

    #[test]
    fn validate_rejects_token_mismatch() {
        let mut trace = TraceRecord::new("s1", "gpt-4o-mini", Spectrum::Edge, 120, 10, 25);
        trace.total_tokens = 99;
        assert_eq!(
            trace.validate(),
            Err(CollectorError::TokenMismatch {
                total: 99,
                input: 10,
                output: 25
            })
        );
    }

    #[test]
    fn validate_rejects_out_of_range_feedback() {
        let trace =
            TraceRecord::new("s1", "gpt-4o-mini", Spectrum::Context, 120, 10, 25).with_feedback(1.5);
        assert!(matches!(
            trace.validate(),
            Err(CollectorError::ScoreOutOfRange { .. })
        ));
    }

    #[test]
    fn validate_rejects_empty_model() {
        let trace = TraceRecord::new("s1", "", Spectrum::Context, 120, 10, 25);
        assert!(matches!(
            trace.validate(),
            Err(CollectorError::Malformed { .. })
        ));
    }
}

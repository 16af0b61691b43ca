//! Threat assessments produced by inference, and the alerts built from them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified risk of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,

    /// The model could not score the footage
    Unknown,
}

impl RiskLevel {
    /// Ordering rank; `Unknown` has none
    fn rank(self) -> Option<u8> {
        match self {
            Self::Low => Some(0),
            Self::Medium => Some(1),
            Self::High => Some(2),
            Self::Unknown => None,
        }
    }

    /// Whether this level is at or above `threshold`.
    ///
    /// `Unknown` never meets a threshold, and an `Unknown` threshold is never met.
    pub fn meets(self, threshold: RiskLevel) -> bool {
        match (self.rank(), threshold.rank()) {
            (Some(level), Some(min)) => level >= min,
            _ => false,
        }
    }

    /// Map a 0-10 risk score onto a level
    pub fn from_score(score: u8, cutoffs: &RiskCutoffs) -> Self {
        if score >= cutoffs.high {
            Self::High
        } else if score >= cutoffs.medium {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Capitalized label used in alert subjects
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Unknown => "Unknown",
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::High
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Score cutoffs for mapping a 0-10 risk score to a level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCutoffs {
    /// Minimum score for `Medium` (default: 4)
    #[serde(default = "default_medium_cutoff")]
    pub medium: u8,

    /// Minimum score for `High` (default: 6)
    #[serde(default = "default_high_cutoff")]
    pub high: u8,
}

fn default_medium_cutoff() -> u8 {
    4
}
fn default_high_cutoff() -> u8 {
    6
}

impl Default for RiskCutoffs {
    fn default() -> Self {
        Self {
            medium: default_medium_cutoff(),
            high: default_high_cutoff(),
        }
    }
}

/// Validated result of one successful inference call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub artifact_id: String,

    pub risk_level: RiskLevel,

    /// Raw 0-10 score (absent when the level is `Unknown`)
    pub risk_score: Option<u8>,

    /// Model confidence in [0, 1]
    pub confidence: f64,

    /// Short subject of the potential incident
    pub summary: String,

    /// Greeting to the security team mentioning the threat
    pub body: String,

    /// Detailed description of the footage
    pub full_analysis: String,

    /// The model's structured output, as returned
    pub raw_model_output: serde_json::Value,

    pub assessed_at: DateTime<Utc>,
}

/// Alert published when a segment's risk meets the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub artifact_id: String,
    pub risk_level: RiskLevel,
    pub risk_score: Option<u8>,
    pub confidence: f64,
    pub summary: String,
    pub body: String,
    pub full_analysis: String,
    pub source_location: String,
    pub generated_at: DateTime<Utc>,
}

impl AlertMessage {
    /// Build an alert from an assessment
    pub fn from_assessment(assessment: &ThreatAssessment, source_location: &str) -> Self {
        Self {
            artifact_id: assessment.artifact_id.clone(),
            risk_level: assessment.risk_level,
            risk_score: assessment.risk_score,
            confidence: assessment.confidence,
            summary: assessment.summary.clone(),
            body: assessment.body.clone(),
            full_analysis: assessment.full_analysis.clone(),
            source_location: source_location.to_string(),
            generated_at: Utc::now(),
        }
    }

    /// Subject line, e.g. "High Risk Alert: Person forcing side door"
    pub fn subject(&self) -> String {
        format!("{} Risk Alert: {}", self.risk_level.label(), self.summary)
    }

    /// Plain-text body for e-mail and chat sinks
    pub fn render_text(&self) -> String {
        let score = self
            .risk_score
            .map(|s| format!("{}/10", s))
            .unwrap_or_else(|| "n/a".to_string());

        format!(
            "Risk Level: {} ({})\nConfidence: {:.2}\n\n{}\n\nFull Analysis:\n{}\n\nVideo: {}",
            score,
            self.risk_level,
            self.confidence,
            self.body,
            self.full_analysis,
            self.source_location
        )
    }
}

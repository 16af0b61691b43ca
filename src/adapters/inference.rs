//! Threat-analysis inference client.
//!
//! Wraps an `InferenceBackend` with the prompt, a request timeout, and
//! validation of the model's structured output. Output that does not match
//! the schema is a permanent failure: the same input is expected to produce
//! the same malformed answer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{AdapterError, InferenceBackend, InferenceRequest};
use crate::domain::{RiskCutoffs, RiskLevel, ThreatAssessment, VideoSegment};

/// Highest score the model may return
pub const MAX_RISK_SCORE: u8 = 10;

/// Prompt text and output interpretation for threat analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSchema {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,

    /// Score cutoffs for medium/high
    #[serde(default)]
    pub cutoffs: RiskCutoffs,
}

fn default_system_prompt() -> String {
    "You are an expert security analyst. Analyze the provided video for potential security risks."
        .to_string()
}

fn default_user_prompt() -> String {
    r#"Analyze this video for potential security risks. Mark the risk field in the JSON object below as 6 or higher for the following activities [Theft, Vandalism, Assault, Burglary, Trespassing, Vehicle-related crimes, Workplace violence, Employee misconduct, Fraud attempts, Public intoxication, Unauthorized access, Arson, Harassment, Property damage]. If there is no immediate threat visible, ensure the risk score stays below 4. If the footage cannot be assessed at all, set risk to null.
Please respond with only a JSON object containing 5 keys:
1. "risk": The risk score out of 10 (integer), or null.
2. "confidence": Your confidence in the score, between 0 and 1.
3. "subject": A brief subject of the potential incident.
4. "body": A brief greeting to the security team, mentioning the potential threat.
5. "full_analysis": A detailed description of the potential incident, considering the video content."#
        .to_string()
}

impl Default for PromptSchema {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            user_prompt: default_user_prompt(),
            cutoffs: RiskCutoffs::default(),
        }
    }
}

/// Inference client with timeout and output validation
pub struct InferenceClient {
    backend: Arc<dyn InferenceBackend>,
    schema: PromptSchema,
    timeout: Duration,
}

impl InferenceClient {
    /// Create a new client
    pub fn new(backend: Arc<dyn InferenceBackend>, schema: PromptSchema, timeout: Duration) -> Self {
        Self {
            backend,
            schema,
            timeout,
        }
    }

    /// Name of the underlying backend
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Analyze a segment.
    ///
    /// Takes ownership of the segment; its bytes are released as soon as the
    /// backend call returns. A call that exceeds the timeout is dropped and
    /// reported as `AdapterError::Timeout`.
    #[instrument(skip(self, segment), fields(artifact_id = %segment.artifact_id, size = segment.size_bytes))]
    pub async fn analyze(&self, segment: VideoSegment) -> Result<ThreatAssessment, AdapterError> {
        let artifact_id = segment.artifact_id.clone();

        let request = InferenceRequest {
            segment: &segment,
            system_prompt: &self.schema.system_prompt,
            user_prompt: &self.schema.user_prompt,
        };

        let raw = match tokio::time::timeout(self.timeout, self.backend.invoke(request)).await {
            Ok(result) => result?,
            Err(_) => return Err(AdapterError::Timeout(self.timeout)),
        };
        drop(segment);

        debug!(backend = self.backend.name(), len = raw.len(), "Model answered");

        parse_assessment(&artifact_id, &raw, &self.schema.cutoffs)
    }
}

/// Validate raw model text and turn it into an assessment
pub fn parse_assessment(
    artifact_id: &str,
    raw: &str,
    cutoffs: &RiskCutoffs,
) -> Result<ThreatAssessment, AdapterError> {
    let json_text = strip_code_fence(raw);

    let value: Value = serde_json::from_str(json_text)
        .map_err(|e| AdapterError::SchemaViolation(format!("Output is not JSON: {}", e)))?;

    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::SchemaViolation("Output is not a JSON object".to_string()))?;

    let risk_score = match object.get("risk") {
        None => {
            return Err(AdapterError::SchemaViolation("Missing field 'risk'".to_string()));
        }
        Some(Value::Null) => None,
        Some(v) => Some(parse_score(v)?),
    };

    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| {
            AdapterError::SchemaViolation("Field 'confidence' must be a number".to_string())
        })?;

    if !(0.0..=1.0).contains(&confidence) {
        return Err(AdapterError::SchemaViolation(format!(
            "Confidence {} is outside [0, 1]",
            confidence
        )));
    }

    let summary = required_string(object, "subject")?;
    let body = optional_string(object, "body")?;
    let full_analysis = optional_string(object, "full_analysis")?;

    let risk_level = risk_score
        .map(|s| RiskLevel::from_score(s, cutoffs))
        .unwrap_or(RiskLevel::Unknown);

    Ok(ThreatAssessment {
        artifact_id: artifact_id.to_string(),
        risk_level,
        risk_score,
        confidence,
        summary,
        body,
        full_analysis,
        raw_model_output: value,
        assessed_at: Utc::now(),
    })
}

fn parse_score(value: &Value) -> Result<u8, AdapterError> {
    let score = value
        .as_f64()
        .filter(|f| f.fract() == 0.0)
        .ok_or_else(|| AdapterError::SchemaViolation(format!("Risk {} is not an integer", value)))?;

    if !(0.0..=f64::from(MAX_RISK_SCORE)).contains(&score) {
        return Err(AdapterError::SchemaViolation(format!(
            "Risk {} is outside 0..={}",
            score, MAX_RISK_SCORE
        )));
    }

    Ok(score as u8)
}

fn required_string(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, AdapterError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| AdapterError::SchemaViolation(format!("Field '{}' must be a string", key)))
}

fn optional_string(
    object: &serde_json::Map<String, Value>,
    key: &str,
) -> Result<String, AdapterError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(_) => required_string(object, key),
    }
}

/// Strip a surrounding markdown code fence (```json ... ```), if any
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }

    let without_open = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return trimmed,
    };

    without_open.trim_end().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "risk": 8,
        "confidence": 0.92,
        "subject": "Person forcing side door",
        "body": "Hello security team, a possible break-in was recorded.",
        "full_analysis": "An individual pries the side door open with a tool."
    }"#;

    #[test]
    fn test_parse_valid_output() {
        let assessment = parse_assessment("seg-001", VALID, &RiskCutoffs::default()).unwrap();

        assert_eq!(assessment.artifact_id, "seg-001");
        assert_eq!(assessment.risk_level, RiskLevel::High);
        assert_eq!(assessment.risk_score, Some(8));
        assert_eq!(assessment.confidence, 0.92);
        assert_eq!(assessment.summary, "Person forcing side door");
        assert_eq!(assessment.raw_model_output["risk"], 8);
    }

    #[test]
    fn test_parse_fenced_output() {
        let fenced = format!("```json\n{}\n```", VALID);
        let assessment = parse_assessment("seg-001", &fenced, &RiskCutoffs::default()).unwrap();
        assert_eq!(assessment.risk_score, Some(8));
    }

    #[test]
    fn test_null_risk_is_unknown() {
        let raw = r#"{"risk": null, "confidence": 0.1, "subject": "Camera obstructed"}"#;
        let assessment = parse_assessment("seg-009", raw, &RiskCutoffs::default()).unwrap();

        assert_eq!(assessment.risk_level, RiskLevel::Unknown);
        assert_eq!(assessment.risk_score, None);
        assert_eq!(assessment.body, "");
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let cutoffs = RiskCutoffs::default();

        let risk_too_high = r#"{"risk": 11, "confidence": 0.5, "subject": "x"}"#;
        assert!(matches!(
            parse_assessment("a", risk_too_high, &cutoffs),
            Err(AdapterError::SchemaViolation(_))
        ));

        let fractional = r#"{"risk": 6.5, "confidence": 0.5, "subject": "x"}"#;
        assert!(matches!(
            parse_assessment("a", fractional, &cutoffs),
            Err(AdapterError::SchemaViolation(_))
        ));

        let bad_confidence = r#"{"risk": 2, "confidence": 1.5, "subject": "x"}"#;
        assert!(matches!(
            parse_assessment("a", bad_confidence, &cutoffs),
            Err(AdapterError::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_missing_fields_rejected() {
        let cutoffs = RiskCutoffs::default();

        let no_risk = r#"{"confidence": 0.5, "subject": "x"}"#;
        assert!(parse_assessment("a", no_risk, &cutoffs).is_err());

        let no_subject = r#"{"risk": 1, "confidence": 0.5}"#;
        assert!(parse_assessment("a", no_subject, &cutoffs).is_err());

        let prose = "The video shows a quiet parking lot.";
        let err = parse_assessment("a", prose, &cutoffs).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_default_prompt_mentions_schema_keys() {
        let schema = PromptSchema::default();
        for key in ["\"risk\"", "\"confidence\"", "\"subject\"", "\"full_analysis\""] {
            assert!(schema.user_prompt.contains(key), "prompt missing {}", key);
        }
    }
}

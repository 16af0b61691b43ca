//! Segment limits enforced before inference.
//!
//! Rejects segments the model cannot use:
//! - Locators that match no accepted pattern (non-video files)
//! - Content types outside `video/*`
//! - Empty or oversized segments

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::AdapterError;
use crate::domain::VideoSegment;

/// Limits applied to every segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentLimits {
    /// Maximum segment size in bytes (default: 1GB)
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    /// Glob patterns a locator must match (case-insensitive)
    #[serde(default = "default_accepted_patterns")]
    pub accepted_patterns: Vec<String>,
}

fn default_max_segment_bytes() -> u64 {
    1024 * 1024 * 1024
} // 1GB

fn default_accepted_patterns() -> Vec<String> {
    vec![
        "**/*.mp4".to_string(),
        "*.mp4".to_string(),
        "**/*.mov".to_string(),
        "*.mov".to_string(),
        "**/*.mkv".to_string(),
        "*.mkv".to_string(),
        "**/*.webm".to_string(),
        "*.webm".to_string(),
    ]
}

impl Default for SegmentLimits {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
            accepted_patterns: default_accepted_patterns(),
        }
    }
}

impl SegmentLimits {
    /// Check if a locator matches any accepted pattern
    pub fn is_accepted(&self, locator: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        // Match on the path part only; query strings never carry the extension
        let path = locator.split(['?', '#']).next().unwrap_or(locator);

        self.accepted_patterns.iter().any(|pattern_str| {
            Pattern::new(pattern_str)
                .map(|pattern| pattern.matches_with(path, options))
                .unwrap_or(false)
        })
    }

    /// Validate a locator before fetching
    pub fn validate_locator(&self, locator: &str) -> Result<(), SafetyViolation> {
        if !self.is_accepted(locator) {
            return Err(SafetyViolation::UnsupportedLocator {
                locator: locator.to_string(),
            });
        }
        Ok(())
    }

    /// Validate a fetched segment against size and type limits
    pub fn validate_segment(&self, segment: &VideoSegment) -> Result<(), SafetyViolation> {
        if segment.size_bytes == 0 {
            return Err(SafetyViolation::EmptySegment);
        }

        if segment.size_bytes > self.max_segment_bytes {
            return Err(SafetyViolation::MaxSegmentBytes {
                actual: segment.size_bytes,
                limit: self.max_segment_bytes,
            });
        }

        if !segment.content_type.starts_with("video/") {
            return Err(SafetyViolation::UnsupportedContentType {
                content_type: segment.content_type.clone(),
            });
        }

        Ok(())
    }
}

/// Segment limit violations; all are permanent
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Locator matches no accepted pattern: {locator}")]
    UnsupportedLocator { locator: String },

    #[error("Segment is empty")]
    EmptySegment,

    #[error("Maximum segment bytes exceeded: {actual} > {limit}")]
    MaxSegmentBytes { actual: u64, limit: u64 },

    #[error("Unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },
}

impl From<SafetyViolation> for AdapterError {
    fn from(violation: SafetyViolation) -> Self {
        AdapterError::UnsupportedContent(violation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SegmentLimits::default();
        assert_eq!(limits.max_segment_bytes, 1024 * 1024 * 1024);
        assert!(!limits.accepted_patterns.is_empty());
    }

    #[test]
    fn test_accepted_locators() {
        let limits = SegmentLimits::default();

        assert!(limits.is_accepted("seg-001.mp4"));
        assert!(limits.is_accepted("s3://footage/2024/05/front.mp4"));
        assert!(limits.is_accepted("CAMERA/FRONT.MP4"));
        assert!(limits.is_accepted("https://store.local/a.webm?sig=abc"));

        assert!(!limits.is_accepted("notes.txt"));
        assert!(!limits.is_accepted("s3://footage/.env"));
    }

    #[test]
    fn test_segment_validation() {
        let limits = SegmentLimits {
            max_segment_bytes: 100,
            ..Default::default()
        };

        let ok = VideoSegment::new("a", "a.mp4", vec![1; 10], "video/mp4");
        assert!(limits.validate_segment(&ok).is_ok());

        let empty = VideoSegment::new("a", "a.mp4", Vec::new(), "video/mp4");
        assert!(matches!(
            limits.validate_segment(&empty),
            Err(SafetyViolation::EmptySegment)
        ));

        let large = VideoSegment::new("a", "a.mp4", vec![1; 200], "video/mp4");
        assert!(matches!(
            limits.validate_segment(&large),
            Err(SafetyViolation::MaxSegmentBytes { .. })
        ));

        let text = VideoSegment::new("a", "a.mp4", vec![1; 10], "text/plain");
        assert!(matches!(
            limits.validate_segment(&text),
            Err(SafetyViolation::UnsupportedContentType { .. })
        ));
    }

    #[test]
    fn test_violation_is_permanent() {
        let err: AdapterError = SafetyViolation::EmptySegment.into();
        assert!(!err.is_retryable());
    }
}

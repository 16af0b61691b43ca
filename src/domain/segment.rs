//! Video segments fetched from the artifact store.
//!
//! A segment is owned by exactly one processing attempt and is dropped once
//! it has been submitted for inference.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};

/// Bytes of one motion-triggered video segment
pub struct VideoSegment {
    /// Artifact this segment belongs to
    pub artifact_id: String,

    /// Locator the bytes were fetched from
    pub source_location: String,

    /// Raw segment bytes
    pub bytes: Vec<u8>,

    /// Size in bytes
    pub size_bytes: u64,

    /// MIME type (e.g. "video/mp4")
    pub content_type: String,

    /// When the segment was fetched
    pub fetched_at: DateTime<Utc>,
}

impl VideoSegment {
    /// Create a new segment
    pub fn new(
        artifact_id: impl Into<String>,
        source_location: impl Into<String>,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        let size_bytes = bytes.len() as u64;
        Self {
            artifact_id: artifact_id.into(),
            source_location: source_location.into(),
            bytes,
            size_bytes,
            content_type: content_type.into(),
            fetched_at: Utc::now(),
        }
    }

    /// Container format hint for inference backends ("mp4", "mov", ...)
    pub fn format(&self) -> &str {
        match self.content_type.as_str() {
            "video/mp4" => "mp4",
            "video/quicktime" => "mov",
            "video/x-matroska" => "mkv",
            "video/webm" => "webm",
            _ => Path::new(&self.source_location)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("mp4"),
        }
    }
}

// Bytes are deliberately left out of the debug output.
impl fmt::Debug for VideoSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoSegment")
            .field("artifact_id", &self.artifact_id)
            .field("source_location", &self.source_location)
            .field("size_bytes", &self.size_bytes)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Guess a MIME type from a locator's extension
pub fn content_type_for(locator: &str) -> &'static str {
    let ext = Path::new(locator)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

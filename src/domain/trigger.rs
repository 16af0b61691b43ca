//! Trigger events that start segment processing.
//!
//! Delivery is at-least-once: the same event may arrive several times and
//! events for different artifacts may arrive in any order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors decoding trigger payloads
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Invalid trigger JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object key is not valid UTF-8 after decoding: {0}")]
    InvalidKey(String),
}

/// Notification that a finished video segment is ready for analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Unique per physical object and version
    pub artifact_id: String,

    /// Opaque locator handed to the artifact store (`s3://`, `file://`, or a path)
    pub source_location: String,

    /// When the event was received
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// Create a new trigger event received now
    pub fn new(artifact_id: impl Into<String>, source_location: impl Into<String>) -> Self {
        Self {
            artifact_id: artifact_id.into(),
            source_location: source_location.into(),
            received_at: Utc::now(),
        }
    }

    /// Parse a trigger payload.
    ///
    /// Accepts a single event object, an array of events, or an object store
    /// notification with a `Records` array.
    pub fn parse_batch(json: &str) -> Result<Vec<Self>, TriggerError> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        if value.get("Records").is_some() {
            return Self::from_s3_notification(value);
        }

        if value.is_array() {
            return Ok(serde_json::from_value(value)?);
        }

        Ok(vec![serde_json::from_value(value)?])
    }

    /// Convert an S3-style event notification into trigger events.
    ///
    /// Only `ObjectCreated*` records are kept. Keys are URL-decoded with `+`
    /// meaning space, as the notification encodes them.
    pub fn from_s3_notification(value: serde_json::Value) -> Result<Vec<Self>, TriggerError> {
        let notification: S3Notification = serde_json::from_value(value)?;
        let mut events = Vec::with_capacity(notification.records.len());

        for record in notification.records {
            if !record.event_name.is_empty() && !record.event_name.starts_with("ObjectCreated") {
                continue;
            }

            let bucket = record.s3.bucket.name;
            let key = decode_object_key(&record.s3.object.key)?;

            let version = record
                .s3
                .object
                .version_id
                .or(record.s3.object.e_tag)
                .or(record.s3.object.sequencer);

            let artifact_id = match version {
                Some(v) => format!("{}/{}@{}", bucket, key, v),
                None => format!("{}/{}", bucket, key),
            };

            events.push(Self::new(artifact_id, format!("s3://{}/{}", bucket, key)));
        }

        Ok(events)
    }
}

/// Decode a URL-encoded object key (`+` is a space)
pub fn decode_object_key(raw: &str) -> Result<String, TriggerError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|k| k.into_owned())
        .map_err(|_| TriggerError::InvalidKey(raw.to_string()))
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    #[serde(rename = "versionId", default)]
    version_id: Option<String>,
    #[serde(rename = "eTag", default)]
    e_tag: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

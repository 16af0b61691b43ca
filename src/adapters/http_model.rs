//! HTTP inference backend for hosted multimodal models.
//!
//! Sends a `messages-v1` request (system prompt, one user turn holding the
//! video and the instruction text) to `{endpoint}/model/{model_id}/invoke`.
//! Segments stored in S3 are passed by reference; anything else is inlined
//! as base64.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AdapterError, InferenceBackend, InferenceRequest};

/// Configuration for the HTTP model backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpModelConfig {
    /// Runtime endpoint, e.g. "https://bedrock-runtime.us-east-1.amazonaws.com"
    pub endpoint: String,

    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Bearer API key
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_top_p")]
    pub top_p: f64,

    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_model_id() -> String {
    "amazon.nova-lite-v1:0".to_string()
}
fn default_max_new_tokens() -> u32 {
    3200
}
fn default_temperature() -> f64 {
    0.3
}
fn default_top_p() -> f64 {
    0.1
}
fn default_top_k() -> u32 {
    20
}

impl HttpModelConfig {
    /// Config with default model parameters for `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            model_id: default_model_id(),
            api_key: None,
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    #[serde(rename = "schemaVersion")]
    schema_version: &'static str,
    system: Vec<TextBlock<'a>>,
    messages: Vec<Message<'a>>,
    #[serde(rename = "inferenceConfig")]
    inference_config: InferenceConfig,
}

#[derive(Debug, Serialize)]
struct TextBlock<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ContentBlock<'a> {
    Video { video: VideoBlock<'a> },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct VideoBlock<'a> {
    format: &'a str,
    source: VideoSource,
}

#[derive(Debug, Serialize)]
enum VideoSource {
    #[serde(rename = "s3Location")]
    S3Location { uri: String },
    #[serde(rename = "bytes")]
    Bytes(String),
}

#[derive(Debug, Serialize)]
struct InferenceConfig {
    max_new_tokens: u32,
    top_p: f64,
    top_k: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    output: ResponseOutput,
    #[serde(rename = "stopReason", default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseOutput {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Vec<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    text: Option<String>,
}

/// Hosted model backend
pub struct HttpModelBackend {
    config: HttpModelConfig,
    client: reqwest::Client,
}

impl HttpModelBackend {
    /// Create a new backend
    pub fn new(config: HttpModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Build the invoke URL
    fn invoke_url(&self) -> String {
        format!(
            "{}/model/{}/invoke",
            self.config.endpoint.trim_end_matches('/'),
            urlencoding::encode(&self.config.model_id)
        )
    }

    fn build_request<'a>(&self, request: &InferenceRequest<'a>) -> ModelRequest<'a> {
        let segment = request.segment;

        let source = if segment.source_location.starts_with("s3://") {
            VideoSource::S3Location {
                uri: segment.source_location.clone(),
            }
        } else {
            VideoSource::Bytes(base64::engine::general_purpose::STANDARD.encode(&segment.bytes))
        };

        ModelRequest {
            schema_version: "messages-v1",
            system: vec![TextBlock {
                text: request.system_prompt,
            }],
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentBlock::Video {
                        video: VideoBlock {
                            format: segment.format(),
                            source,
                        },
                    },
                    ContentBlock::Text {
                        text: request.user_prompt,
                    },
                ],
            }],
            inference_config: InferenceConfig {
                max_new_tokens: self.config.max_new_tokens,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
                temperature: self.config.temperature,
            },
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpModelBackend {
    fn name(&self) -> &str {
        "http-model"
    }

    async fn invoke(&self, request: InferenceRequest<'_>) -> Result<String, AdapterError> {
        let body = self.build_request(&request);

        let mut http = self.client.post(self.invoke_url()).json(&body);
        if let Some(ref key) = self.config.api_key {
            http = http.header("Authorization", format!("Bearer {}", key));
        }

        let response = http.send().await.map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_http_status(status.as_u16(), text));
        }

        // A body that arrives intact but in the wrong shape will not improve on redelivery
        let text = response.text().await.map_err(AdapterError::from_reqwest)?;
        let parsed: ModelResponse = serde_json::from_str(&text).map_err(|e| {
            AdapterError::SchemaViolation(format!("Unexpected response envelope: {}", e))
        })?;

        debug!(
            model = %self.config.model_id,
            stop_reason = parsed.stop_reason.as_deref().unwrap_or(""),
            "Model response received"
        );

        if parsed.stop_reason.as_deref() == Some("content_filtered") {
            return Err(AdapterError::ContentRejected(format!(
                "Model {} filtered the response",
                self.config.model_id
            )));
        }

        parsed
            .output
            .message
            .content
            .into_iter()
            .find_map(|c| c.text)
            .ok_or_else(|| AdapterError::SchemaViolation("Response contains no text".to_string()))
    }
}

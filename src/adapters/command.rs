//! Local model backend that runs an external command.
//!
//! The segment is written to a temporary file passed as `--video <path>`,
//! the prompt is piped to stdin, and the answer is read from stdout. Exit
//! code 65 (EX_DATAERR) marks the input as unusable; any other failure is
//! treated as transient.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{AdapterError, InferenceBackend, InferenceRequest};

/// Exit code a model command uses to reject its input
pub const EXIT_DATA_ERROR: i32 = 65;

/// Inference backend using a subprocess
pub struct CommandBackend {
    /// Program to run
    program: String,

    /// Extra arguments placed before `--video`
    args: Vec<String>,
}

impl CommandBackend {
    /// Create a backend running `program` with `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl InferenceBackend for CommandBackend {
    fn name(&self) -> &str {
        "command"
    }

    async fn invoke(&self, request: InferenceRequest<'_>) -> Result<String, AdapterError> {
        let segment = request.segment;

        let video_file = tempfile::Builder::new()
            .prefix("vigil-segment-")
            .suffix(&format!(".{}", segment.format()))
            .tempfile()
            .map_err(|e| AdapterError::Transient(format!("Failed to create temp file: {}", e)))?;

        tokio::fs::write(video_file.path(), &segment.bytes)
            .await
            .map_err(|e| AdapterError::Transient(format!("Failed to write segment: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--video")
            .arg(video_file.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AdapterError::Permanent(format!("Failed to spawn model command '{}': {}", self.program, e))
            })?;

        // Write prompt to stdin
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = format!("{}\n\n{}", request.system_prompt, request.user_prompt);
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AdapterError::Transient(format!("Failed to write prompt: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AdapterError::Transient(format!("Failed to wait for model command: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = format!(
                "Model command '{}' exited with {:?}: {}",
                self.program,
                output.status.code(),
                stderr
            );
            return match output.status.code() {
                Some(EXIT_DATA_ERROR) => Err(AdapterError::InvalidInput(message)),
                _ => Err(AdapterError::Transient(message)),
            };
        }

        String::from_utf8(output.stdout)
            .map_err(|_| AdapterError::SchemaViolation("Model output is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoSegment;

    fn request(segment: &VideoSegment) -> InferenceRequest<'_> {
        InferenceRequest {
            segment,
            system_prompt: "system",
            user_prompt: "user",
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_output_returned() {
        let backend = CommandBackend::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"risk": 1}'"#.to_string(),
                "model".to_string(),
            ],
        );
        let segment = VideoSegment::new("a", "a.mp4", vec![0u8; 8], "video/mp4");

        let output = backend.invoke(request(&segment)).await.unwrap();
        assert_eq!(output.trim(), r#"{"risk": 1}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_data_error_exit_is_permanent() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".to_string(), "cat > /dev/null; exit 65".to_string(), "model".to_string()],
        );
        let segment = VideoSegment::new("a", "a.mp4", vec![0u8; 8], "video/mp4");

        let err = backend.invoke(request(&segment)).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidInput(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_exit_is_transient() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".to_string(), "cat > /dev/null; exit 1".to_string(), "model".to_string()],
        );
        let segment = VideoSegment::new("a", "a.mp4", vec![0u8; 8], "video/mp4");

        let err = backend.invoke(request(&segment)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let backend = CommandBackend::new("/nonexistent/vigil-model", vec![]);
        let segment = VideoSegment::new("a", "a.mp4", vec![0u8; 8], "video/mp4");

        let err = backend.invoke(request(&segment)).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}

//! Artifact store clients.
//!
//! - `FsArtifactStore`: segments on a local (or mounted) filesystem
//! - `HttpArtifactStore`: segments behind an HTTP object endpoint

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{AdapterError, ArtifactStore, StoredObject};
use crate::domain::content_type_for;

/// Reads segments from a directory
pub struct FsArtifactStore {
    /// Directory relative locators are resolved against
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a locator to a path on disk
    fn resolve(&self, locator: &str) -> Result<PathBuf, AdapterError> {
        if locator.contains("://") && !locator.starts_with("file://") {
            return Err(AdapterError::InvalidInput(format!(
                "Unsupported locator scheme for filesystem store: {}",
                locator
            )));
        }

        let path = PathBuf::from(locator.trim_start_matches("file://"));
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.root.join(path))
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn get(&self, locator: &str) -> Result<StoredObject, AdapterError> {
        let path = self.resolve(locator)?;

        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => AdapterError::NotFound(path.display().to_string()),
            ErrorKind::PermissionDenied => {
                AdapterError::Permanent(format!("Permission denied: {}", path.display()))
            }
            _ => AdapterError::Transient(format!("Failed to read {}: {}", path.display(), e)),
        })?;

        Ok(StoredObject {
            bytes,
            content_type: content_type_for(locator).to_string(),
        })
    }
}

/// Fetches segments over HTTP (path-style object URLs)
pub struct HttpArtifactStore {
    /// Base URL, e.g. "https://objects.internal"
    endpoint: String,

    /// Optional bearer token
    token: Option<String>,

    client: reqwest::Client,
}

impl HttpArtifactStore {
    /// Create a new client
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    /// Build the object URL for a locator.
    ///
    /// `s3://bucket/key` maps to `{endpoint}/bucket/key`; absolute http(s)
    /// URLs are used as-is; anything else is a path under the endpoint.
    pub fn url_for(&self, locator: &str) -> String {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            return locator.to_string();
        }

        let path = locator.strip_prefix("s3://").unwrap_or(locator);
        let encoded: Vec<String> = path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();

        format!("{}/{}", self.endpoint, encoded.join("/"))
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn get(&self, locator: &str) -> Result<StoredObject, AdapterError> {
        let url = self.url_for(locator);

        let mut request = self.client.get(&url);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(AdapterError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_http_status(status.as_u16(), text));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("video/"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| content_type_for(locator).to_string());

        let bytes = response.bytes().await.map_err(AdapterError::from_reqwest)?;

        Ok(StoredObject {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_reads_relative_locator() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("seg-001.mp4"), b"video")
            .await
            .unwrap();

        let store = FsArtifactStore::new(temp.path());
        let object = store.get("seg-001.mp4").await.unwrap();

        assert_eq!(object.bytes, b"video");
        assert_eq!(object.content_type, "video/mp4");
    }

    #[tokio::test]
    async fn test_fs_store_file_scheme() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("clip.mp4");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let store = FsArtifactStore::new("/unused");
        let locator = format!("file://{}", path.display());
        let object = store.get(&locator).await.unwrap();
        assert_eq!(object.bytes.len(), 3);
    }

    #[tokio::test]
    async fn test_fs_store_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp.path());

        let err = store.get("missing.mp4").await.unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fs_store_rejects_remote_scheme() {
        let store = FsArtifactStore::new("/tmp");
        let err = store.get("s3://bucket/key.mp4").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_http_url_for_s3_locator() {
        let store = HttpArtifactStore::new("https://objects.local/", None);
        assert_eq!(
            store.url_for("s3://footage/motion/front door.mp4"),
            "https://objects.local/footage/motion/front%20door.mp4"
        );
        assert_eq!(
            store.url_for("https://cdn.local/a.mp4"),
            "https://cdn.local/a.mp4"
        );
        assert_eq!(store.url_for("clips/a.mp4"), "https://objects.local/clips/a.mp4");
    }
}

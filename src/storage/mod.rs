//! Artifact (blob) storage for input photos and generated results.
//!
//! Backends:
//! - `local`: files under a root directory with a JSON metadata sidecar
//! - `memory`: in-process map (tests)
//!
//! Blobs carry a content type and an optional download token. Public links
//! embed the token and are served by the HTTP layer.

mod local;
mod memory;

pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt blob metadata for {path}: {message}")]
    Metadata { path: String, message: String },
}

/// Metadata stored alongside each blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_token: Option<String>,
}

impl BlobMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            download_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.download_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub metadata: BlobMetadata,
}

/// Blob storage trait - implemented by all storage backends.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Bucket name embedded in public URLs.
    fn bucket(&self) -> &str;

    /// Write (or overwrite) a blob.
    async fn put(&self, path: &str, bytes: Vec<u8>, metadata: BlobMetadata)
        -> Result<(), StorageError>;

    async fn get(&self, path: &str) -> Result<Option<StoredBlob>, StorageError>;

    /// Paths of every blob whose path starts with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remove every blob under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError>;
}

/// Reject absolute paths, empty segments and parent references.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Public download URL for a blob.
///
/// Format: `{base}/v0/b/{bucket}/o/{url-encoded path}?alt=media&token={token}`.
pub fn public_url(base_url: &str, bucket: &str, path: &str, token: &str) -> String {
    format!(
        "{}/v0/b/{}/o/{}?alt=media&token={}",
        base_url.trim_end_matches('/'),
        bucket,
        urlencoding::encode(path),
        urlencoding::encode(token)
    )
}

/// Content type to submit for a stored blob: `image/*` types pass through,
/// everything else is treated as PNG.
pub fn normalize_image_mime(content_type: Option<&str>) -> String {
    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match essence.strip_prefix("image/") {
        Some(subtype) if !subtype.is_empty() => essence,
        _ => "image/png".to_string(),
    }
}

/// File extension for an image content type.
pub fn extension_for_mime(content_type: &str) -> &'static str {
    match normalize_image_mime(Some(content_type)).as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/heic" => "heic",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_encodes_path() {
        let url = public_url(
            "https://booth.example.com/",
            "booth",
            "tasks/abc/output.png",
            "tok-1",
        );
        assert_eq!(
            url,
            "https://booth.example.com/v0/b/booth/o/tasks%2Fabc%2Foutput.png?alt=media&token=tok-1"
        );
    }

    #[test]
    fn non_image_types_default_to_png() {
        assert_eq!(
            normalize_image_mime(Some("application/octet-stream")),
            "image/png"
        );
        assert_eq!(normalize_image_mime(None), "image/png");
        assert_eq!(normalize_image_mime(Some("image/")), "image/png");
        assert_eq!(normalize_image_mime(Some("text/plain")), "image/png");
    }

    #[test]
    fn image_types_pass_through() {
        assert_eq!(normalize_image_mime(Some("image/jpeg")), "image/jpeg");
        assert_eq!(
            normalize_image_mime(Some("Image/WEBP; charset=binary")),
            "image/webp"
        );
    }

    #[test]
    fn extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/png"), "png");
        assert_eq!(extension_for_mime("application/octet-stream"), "png");
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("tasks/a/output.png").is_ok());
        for bad in ["", "/etc/passwd", "tasks/../secret", "tasks//x", "a\\b", "./x"] {
            assert!(validate_path(bad).is_err(), "{} should be rejected", bad);
        }
    }
}

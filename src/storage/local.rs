//! Filesystem blob store.
//!
//! Layout: `{root}/{bucket}/{path}` holds the bytes and
//! `{root}/{bucket}/{path}.meta.json` holds the `BlobMetadata`.

use super::{validate_path, BlobMetadata, BlobStore, StorageError, StoredBlob};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

const META_SUFFIX: &str = ".meta.json";
const TMP_SUFFIX: &str = ".tmp";

pub struct LocalBlobStore {
    bucket: String,
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(base_dir: PathBuf, bucket: &str) -> Result<Self, StorageError> {
        let root = base_dir.join(bucket);
        fs::create_dir_all(&root).await?;
        Ok(Self {
            bucket: bucket.to_string(),
            root,
        })
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn meta_path(&self, path: &str) -> PathBuf {
        self.root.join(format!("{}{}", path, META_SUFFIX))
    }

    /// Write via a temp file and rename so readers never see partial bytes.
    async fn write_atomic(target: &Path, data: &[u8]) -> Result<(), StorageError> {
        let tmp = PathBuf::from(format!("{}{}", target.display(), TMP_SUFFIX));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, target).await?;
        Ok(())
    }

    fn list_blocking(root: &Path, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping unreadable blob entry");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(root).ok()?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if rel.ends_with(META_SUFFIX) || rel.ends_with(TMP_SUFFIX) {
                    return None;
                }
                Some(rel)
            })
            .filter(|rel| rel.starts_with(prefix))
            .collect();
        paths.sort();
        paths
    }
}

fn validate_prefix(prefix: &str) -> Result<(), StorageError> {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(());
    }
    validate_path(trimmed)
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        metadata: BlobMetadata,
    ) -> Result<(), StorageError> {
        validate_path(path)?;
        if path.ends_with(META_SUFFIX) || path.ends_with(TMP_SUFFIX) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        let target = self.blob_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let meta = serde_json::to_vec_pretty(&metadata).map_err(|e| StorageError::Metadata {
            path: path.to_string(),
            message: e.to_string(),
        })?;

        Self::write_atomic(&target, &bytes).await?;
        Self::write_atomic(&self.meta_path(path), &meta).await?;
        tracing::debug!(path = %path, bytes = bytes.len(), "Stored blob");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StoredBlob>, StorageError> {
        validate_path(path)?;
        let bytes = match fs::read(self.blob_path(path)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let metadata = match fs::read(self.meta_path(path)).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| StorageError::Metadata {
                path: path.to_string(),
                message: e.to_string(),
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                BlobMetadata::new("application/octet-stream")
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Some(StoredBlob { bytes, metadata }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        validate_prefix(prefix)?;
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || Self::list_blocking(&root, &prefix))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let paths = self.list(prefix).await?;
        for path in &paths {
            fs::remove_file(self.blob_path(path)).await?;
            if let Err(err) = fs::remove_file(self.meta_path(path)).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }

        // Drop the now-empty folder; ignore failures (other files may remain).
        let folder = prefix.trim_end_matches('/');
        if !folder.is_empty() && prefix.ends_with('/') {
            let _ = fs::remove_dir_all(self.root.join(folder)).await;
        }
        Ok(paths.len())
    }
}

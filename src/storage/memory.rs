//! In-memory blob store (non-persistent).

use super::{validate_path, BlobMetadata, BlobStore, StorageError, StoredBlob};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct InMemoryBlobStore {
    bucket: String,
    blobs: Arc<RwLock<BTreeMap<String, StoredBlob>>>,
}

impl InMemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
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
        self.blobs
            .write()
            .await
            .insert(path.to_string(), StoredBlob { bytes, metadata });
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<StoredBlob>, StorageError> {
        validate_path(path)?;
        Ok(self.blobs.read().await.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .blobs
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut blobs = self.blobs.write().await;
        let before = blobs.len();
        blobs.retain(|k, _| !k.starts_with(prefix));
        Ok(before - blobs.len())
    }
}

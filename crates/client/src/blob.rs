use std::collections::HashMap;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::backend::BoxFuture;
use crate::error::BackendResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime_type: String,
    pub bytes: Bytes,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Attachment storage keyed by opaque id. `Ok(None)` means the blob expired or never existed.
pub trait BlobStore: Send + Sync {
    fn get<'a>(&'a self, blob_id: &'a str) -> BoxFuture<'a, BackendResult<Option<Blob>>>;
    fn put<'a>(&'a self, blob: Blob) -> BoxFuture<'a, BackendResult<String>>;
}

/// Content-addressed store: ids are the SHA-256 hex digest of the bytes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_id(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    pub async fn remove(&self, blob_id: &str) -> Option<Blob> {
        self.blobs.write().await.remove(blob_id)
    }
}

impl BlobStore for MemoryBlobStore {
    fn get<'a>(&'a self, blob_id: &'a str) -> BoxFuture<'a, BackendResult<Option<Blob>>> {
        Box::pin(async move { Ok(self.blobs.read().await.get(blob_id).cloned()) })
    }

    fn put<'a>(&'a self, blob: Blob) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let blob_id = Self::content_id(&blob.bytes);
            self.blobs.write().await.insert(blob_id.clone(), blob);
            Ok(blob_id)
        })
    }
}

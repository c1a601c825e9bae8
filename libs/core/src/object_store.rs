//! Object store contract consumed by the fetch pool and the uploader.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Readable body of a fetched or uploaded object.
pub type ObjectBody = Box<dyn AsyncRead + Send + Unpin>;

/// Shared trait object wrapper.
pub type SharedObjectStore = std::sync::Arc<dyn ObjectStore>;

/// Typed store failures. Only throttling and timeouts are transient enough
/// to defer a record for retry; not-found and access-denied are terminal
/// for the record, and anything else fails the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {container}/{key}")]
    NotFound { container: String, key: String },
    #[error("access denied: {container}/{key}")]
    AccessDenied { container: String, key: String },
    #[error("throttled by the object store")]
    Throttled,
    #[error("object store operation timed out")]
    Timeout,
    #[error("object store client error: {message}")]
    Client { message: String },
}

impl ObjectStoreError {
    pub fn retryable(&self) -> bool {
        matches!(self, ObjectStoreError::Throttled | ObjectStoreError::Timeout)
    }

    pub fn code(&self) -> &'static str {
        match self {
            ObjectStoreError::NotFound { .. } => "OBJECT_NOT_FOUND",
            ObjectStoreError::AccessDenied { .. } => "ACCESS_DENIED",
            ObjectStoreError::Throttled => "THROTTLED",
            ObjectStoreError::Timeout => "STORE_TIMEOUT",
            ObjectStoreError::Client { .. } => "CLIENT_ERROR",
        }
    }
}

/// Metadata stamped onto an uploaded bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadMetadata {
    pub content_sha256: String,
    pub content_encoding: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_id: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens a streaming read of one object.
    async fn get_object(&self, container: &str, key: &str)
    -> Result<ObjectBody, ObjectStoreError>;

    /// Streams a finished artifact into the store under `key`, attaching
    /// the given metadata.
    async fn upload_stream(
        &self,
        container: &str,
        key: &str,
        body: ObjectBody,
        metadata: UploadMetadata,
    ) -> Result<(), ObjectStoreError>;
}

/// Upload captured by the in-memory store, for assertions.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub container: String,
    pub key: String,
    pub bytes: Bytes,
    pub metadata: UploadMetadata,
}

/// In-memory store used in tests: seed objects with [`InMemoryObjectStore::put`],
/// inject per-key failures with [`InMemoryObjectStore::fail_get`], and inspect
/// what was uploaded with [`InMemoryObjectStore::uploads`].
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    get_failures: Mutex<HashMap<(String, String), ObjectStoreError>>,
    upload_failure: Mutex<Option<ObjectStoreError>>,
    uploads: Mutex<Vec<UploadRecord>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, container: &str, key: &str, bytes: impl Into<Bytes>) {
        lock(&self.objects).insert((container.to_string(), key.to_string()), bytes.into());
    }

    pub fn fail_get(&self, container: &str, key: &str, error: ObjectStoreError) {
        lock(&self.get_failures).insert((container.to_string(), key.to_string()), error);
    }

    pub fn fail_uploads(&self, error: ObjectStoreError) {
        *lock(&self.upload_failure) = Some(error);
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        lock(&self.uploads).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<ObjectBody, ObjectStoreError> {
        let lookup = (container.to_string(), key.to_string());
        if let Some(error) = lock(&self.get_failures).get(&lookup).cloned() {
            return Err(error);
        }
        let bytes = lock(&self.objects)
            .get(&lookup)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes.to_vec())))
    }

    async fn upload_stream(
        &self,
        container: &str,
        key: &str,
        mut body: ObjectBody,
        metadata: UploadMetadata,
    ) -> Result<(), ObjectStoreError> {
        if let Some(error) = lock(&self.upload_failure).clone() {
            return Err(error);
        }
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer)
            .await
            .map_err(|err| ObjectStoreError::Client {
                message: err.to_string(),
            })?;
        lock(&self.uploads).push(UploadRecord {
            container: container.to_string(),
            key: key.to_string(),
            bytes: Bytes::from(buffer),
            metadata,
        });
        Ok(())
    }
}

//! Streams finalized bundles to the distribution bucket with integrity
//! metadata.

use std::sync::Arc;

use tracing::info;

use baler_bundle::BundleArtifact;
use baler_core::object_store::{ObjectStore, ObjectStoreError, UploadMetadata};

pub const CONTENT_ENCODING: &str = "gzip";
pub const CONTENT_TYPE: &str = "application/gzip";

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    encryption_key_id: Option<String>,
}

impl Uploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        encryption_key_id: Option<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            encryption_key_id,
        }
    }

    /// Uploads the rewound artifact. Retries are the transport's concern,
    /// never attempted here.
    pub async fn upload(
        &self,
        key: &str,
        artifact: BundleArtifact,
    ) -> Result<(), ObjectStoreError> {
        let metadata = UploadMetadata {
            content_sha256: artifact.sha256_hex.clone(),
            content_encoding: CONTENT_ENCODING.into(),
            content_type: CONTENT_TYPE.into(),
            encryption_key_id: self.encryption_key_id.clone(),
        };
        let sha256 = artifact.sha256_hex.clone();
        let size_bytes = artifact.size_bytes;
        let entries = artifact.entries;
        self.store
            .upload_stream(&self.bucket, key, Box::new(artifact.reader), metadata)
            .await?;
        info!(
            bucket = %self.bucket,
            key,
            sha256 = %sha256,
            size_bytes,
            entries,
            "bundle uploaded"
        );
        Ok(())
    }
}

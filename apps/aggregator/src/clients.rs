//! Filesystem-backed object store used by local runs and end-to-end tests.
//! Containers map to directories under a root; uploads land next to a
//! `.meta.json` sidecar carrying the object metadata.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use baler_core::object_store::{ObjectBody, ObjectStore, ObjectStoreError, UploadMetadata};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, container: &str, key: &str) -> PathBuf {
        self.root.join(container).join(key)
    }
}

fn client_error(err: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Client {
        message: err.to_string(),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_object(
        &self,
        container: &str,
        key: &str,
    ) -> Result<ObjectBody, ObjectStoreError> {
        let path = self.object_path(container, key);
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                Err(ObjectStoreError::AccessDenied {
                    container: container.to_string(),
                    key: key.to_string(),
                })
            }
            Err(err) => Err(client_error(err)),
        }
    }

    async fn upload_stream(
        &self,
        container: &str,
        key: &str,
        mut body: ObjectBody,
        metadata: UploadMetadata,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(container, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(client_error)?;
        }
        let mut file = fs::File::create(&path).await.map_err(client_error)?;
        tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(client_error)?;
        file.flush().await.map_err(client_error)?;

        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".meta.json");
        let rendered = serde_json::to_vec_pretty(&metadata)
            .map_err(|err| ObjectStoreError::Client {
                message: err.to_string(),
            })?;
        fs::write(PathBuf::from(sidecar), rendered)
            .await
            .map_err(client_error)?;

        debug!(container, key, "object stored");
        Ok(())
    }
}

//! Failure taxonomy for the bundling pipeline and the batch orchestrator.
//!
//! Every error carries a stable code for logs and metrics plus a
//! retryability verdict. Per-record recoverable failures never surface
//! here; they settle as record outcomes. These are the batch-level
//! failures that send every contributing envelope back to the queue.

use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Failures raised while constructing the archive.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("archive I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("back-pressure overflow: writer stalled for {waited_ms} ms")]
    BackpressureOverflow { waited_ms: u64 },
    #[error("entry {key} streamed {actual} bytes but declared {declared}")]
    EntryLengthMismatch {
        key: String,
        declared: u64,
        actual: u64,
    },
    #[error("archive writer did not shut down within {timeout_ms} ms")]
    WriterStalled { timeout_ms: u64 },
    #[error("object fetch failed: {0}")]
    Fetch(#[source] ObjectStoreError),
    #[error("bundling aborted")]
    Aborted,
}

impl BundleError {
    pub fn retryable(&self) -> bool {
        match self {
            BundleError::Io(_)
            | BundleError::BackpressureOverflow { .. }
            | BundleError::WriterStalled { .. }
            | BundleError::Fetch(_)
            | BundleError::Aborted => true,
            // The object genuinely differs from its declared size; fetching
            // it again returns the same bytes.
            BundleError::EntryLengthMismatch { .. } => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BundleError::Io(_) => "BUNDLE_IO",
            BundleError::BackpressureOverflow { .. } => "BACKPRESSURE_OVERFLOW",
            BundleError::EntryLengthMismatch { .. } => "ENTRY_LENGTH_MISMATCH",
            BundleError::WriterStalled { .. } => "WRITER_STALLED",
            BundleError::Fetch(_) => "FETCH_FAILED",
            BundleError::Aborted => "BUNDLING_ABORTED",
        }
    }
}

/// Failures raised by the orchestrator around the bundling step.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch input of {total_bytes} bytes exceeds the {limit_bytes}-byte limit")]
    BatchTooLarge { total_bytes: u64, limit_bytes: u64 },
    #[error("direct invocation is only honored in test environments (environment: {environment})")]
    DirectInvokeForbidden { environment: String },
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("bundle upload failed: {0}")]
    Upload(#[source] ObjectStoreError),
}

impl BatchError {
    pub fn retryable(&self) -> bool {
        match self {
            // The caller can shrink the batch and redeliver.
            BatchError::BatchTooLarge { .. } => true,
            BatchError::DirectInvokeForbidden { .. } => false,
            BatchError::Bundle(inner) => inner.retryable(),
            BatchError::Upload(_) => true,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            BatchError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            BatchError::DirectInvokeForbidden { .. } => "DIRECT_INVOKE_FORBIDDEN",
            BatchError::Bundle(inner) => inner.error_code(),
            BatchError::Upload(_) => "UPLOAD_FAILED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(
            BatchError::BatchTooLarge {
                total_bytes: 10,
                limit_bytes: 5
            }
            .retryable()
        );
        assert!(
            !BatchError::DirectInvokeForbidden {
                environment: "production".into()
            }
            .retryable()
        );
        assert!(
            BundleError::BackpressureOverflow { waited_ms: 5000 }.retryable()
        );
        assert!(
            !BundleError::EntryLengthMismatch {
                key: "k".into(),
                declared: 2,
                actual: 1
            }
            .retryable()
        );
        assert!(BundleError::Fetch(ObjectStoreError::Timeout).retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            BatchError::Bundle(BundleError::Aborted).error_code(),
            "BUNDLING_ABORTED"
        );
        assert_eq!(
            BatchError::Upload(ObjectStoreError::Throttled).error_code(),
            "UPLOAD_FAILED"
        );
    }
}

//! Core contracts and value types for the baler aggregation engine.
//!
//! This crate exposes the data structures exchanged between the envelope
//! parser, the idempotency guard, the bundling pipeline, and the batch
//! orchestrator, along with the security-critical object-key sanitizer and
//! the object-store contract the pipeline consumes.

pub mod envelope;
pub mod errors;
pub mod object_store;
pub mod path_safety;
pub mod types;

pub use envelope::{MalformedEnvelope, parse_envelope};
pub use errors::{BatchError, BundleError};
pub use object_store::{
    InMemoryObjectStore, ObjectBody, ObjectStore, ObjectStoreError, SharedObjectStore,
    UploadMetadata,
};
pub use path_safety::{KeyRejected, sanitize_object_key};
pub use types::{
    BatchItemFailure, BatchResponse, BatchResult, DeferReason, EventEnvelope, EventPayload,
    ObjectRef, RecordOutcome, SkipReason,
};

//! Budgeted bundling pipeline: concurrent fetch workers feed a single
//! archive writer through a bounded channel, producing one compressed,
//! SHA-256-stamped tar bundle per invocation.

pub mod archive;
mod fetch;
pub mod governor;
pub mod hashing;
mod pipeline;
pub mod spool;

pub use archive::{ArchiveWriter, BundleArtifact};
pub use governor::{BudgetGovernor, PipelineSignal, Stop, StopReason};
pub use hashing::HashingWriter;
pub use pipeline::{BatchContext, BundleConfig, BundleOutcome, bundle_records};
pub use spool::{SpoolBuffer, SpoolReader};

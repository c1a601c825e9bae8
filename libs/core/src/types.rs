//! Value types exchanged between the parser, guard, pipeline, and orchestrator.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single object-change record extracted from an envelope payload.
///
/// ```
/// use baler_core::types::ObjectRef;
///
/// let record = ObjectRef {
///     container: "landing".into(),
///     original_key: "reports/2026/07/daily.csv".into(),
///     declared_size: 2048,
///     version_token: None,
///     sequence_token: "0055AED4D224A8D1".into(),
/// };
/// assert!(!record.record_id().is_empty());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectRef {
    pub container: String,
    pub original_key: String,
    /// Size advertised by the notification; the writer verifies it against
    /// the streamed byte count before committing an entry.
    pub declared_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
    pub sequence_token: String,
}

impl ObjectRef {
    /// Deterministic record identity, doubling as the idempotency key.
    ///
    /// Canonical JSON of `{k: original_key, u: version_token OR
    /// sequence_token}`, percent-escaped. The container is deliberately
    /// excluded so the same object landing in different containers
    /// deduplicates once; the version or sequence token guarantees a fresh
    /// identity whenever the object mutates.
    pub fn record_id(&self) -> String {
        let unique = self
            .version_token
            .as_deref()
            .unwrap_or(&self.sequence_token);
        let canonical =
            serde_json::json!({ "k": self.original_key, "u": unique }).to_string();
        urlencoding::encode(&canonical).into_owned()
    }
}

/// One transport-level unit pulled off the queue. The body is an opaque
/// string until [`crate::envelope::parse_envelope`] decodes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventEnvelope {
    pub id: String,
    pub body: String,
}

/// Top-level event shape handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Synthetic payload carrying pre-parsed records; honored only in test
    /// environments, where it bypasses envelope parsing and idempotency.
    DirectInvoke {
        direct_invoke: bool,
        records: Vec<ObjectRef>,
    },
    /// The normal queue-delivered batch of envelopes.
    Batch { envelopes: Vec<EventEnvelope> },
}

/// How a dispatched record settled during bundling.
///
/// Records carrying a `Bundled` or `Skipped` outcome are consumed and will
/// not be retried; `Deferred` records (and records never dispatched at all)
/// stay in `remaining_records` so their envelopes are redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Bundled,
    Skipped(SkipReason),
    Deferred(DeferReason),
}

/// Terminal per-record skips; the rest of the batch proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnsafeKey,
    NotFound,
    AccessDenied,
    SizeMismatch,
}

impl SkipReason {
    pub fn metric(&self) -> &'static str {
        match self {
            SkipReason::UnsafeKey => "ObjectsSkipped_InvalidKey",
            SkipReason::NotFound => "ObjectsSkipped_NotFound",
            SkipReason::AccessDenied => "ObjectsSkipped_AccessDenied",
            SkipReason::SizeMismatch => "ObjectsSkipped_SizeMismatch",
        }
    }
}

/// Transient per-record setbacks; the record returns to the queue with its
/// envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    Throttled,
    Timeout,
    BudgetStop,
}

impl DeferReason {
    pub fn metric(&self) -> &'static str {
        match self {
            DeferReason::Throttled => "ObjectsDeferred_Throttled",
            DeferReason::Timeout => "ObjectsDeferred_Timeout",
            DeferReason::BudgetStop => "ObjectsDeferred_BudgetStop",
        }
    }
}

/// Outcome of one orchestrated invocation.
///
/// Invariants: `processed_records ∪ remaining_records` equals the survivors
/// of the idempotency stage, the two sets are disjoint, and every envelope
/// in `failed_envelope_ids` was malformed, hit a transient claim error, or
/// contributed at least one remaining record.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub failed_envelope_ids: BTreeSet<String>,
    pub processed_records: Vec<ObjectRef>,
    pub remaining_records: Vec<ObjectRef>,
}

impl BatchResult {
    pub fn into_response(self) -> BatchResponse {
        BatchResponse {
            batch_item_failures: self
                .failed_envelope_ids
                .into_iter()
                .map(|id| BatchItemFailure {
                    item_identifier: id,
                })
                .collect(),
        }
    }
}

/// Wire shape returned to the queue transport. Envelope ids absent from the
/// list are treated as successfully processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

//! Envelope payload parsing.
//!
//! Each transport envelope carries a JSON notification document with a
//! top-level `Records` array. Parsing is strict: a single malformed record
//! fails the whole envelope, never just the record, so redelivery keeps the
//! envelope intact.

use serde::Deserialize;
use thiserror::Error;

use crate::types::{EventEnvelope, ObjectRef};

/// The envelope body could not be decoded into object-change records.
/// Non-retryable; the envelope is reported back to the transport as failed.
#[derive(Debug, Error)]
#[error("malformed envelope {envelope_id}: {reason}")]
pub struct MalformedEnvelope {
    pub envelope_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct NotificationBody {
    #[serde(rename = "Records")]
    records: Vec<RawRecord>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    s3: RawEntity,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    bucket: RawBucket,
    object: RawObject,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    key: String,
    size: i64,
    #[serde(rename = "versionId")]
    version_id: Option<String>,
    sequencer: String,
}

/// Decode an event-notification key. The notification transport
/// form-encodes keys, so `+` stands for a space and percent sequences are
/// escaped bytes.
fn decode_event_key(raw: &str) -> Result<String, String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|err| format!("object key is not valid UTF-8 after decoding: {err}"))
}

/// Parse one envelope into its object-change records.
///
/// An empty `Records` array is a valid, empty envelope. Every record must
/// carry a container name, a key, a sequencer, and a non-negative integer
/// size; anything else makes the whole envelope malformed.
pub fn parse_envelope(envelope: &EventEnvelope) -> Result<Vec<ObjectRef>, MalformedEnvelope> {
    let malformed = |reason: String| MalformedEnvelope {
        envelope_id: envelope.id.clone(),
        reason,
    };

    let body: NotificationBody = serde_json::from_str(&envelope.body)
        .map_err(|err| malformed(format!("body is not a notification document: {err}")))?;

    let mut records = Vec::with_capacity(body.records.len());
    for raw in body.records {
        let RawObject {
            key,
            size,
            version_id,
            sequencer,
        } = raw.s3.object;
        let container = raw.s3.bucket.name;

        if container.is_empty() {
            return Err(malformed("record has an empty bucket name".into()));
        }
        if key.is_empty() {
            return Err(malformed("record has an empty object key".into()));
        }
        if sequencer.is_empty() {
            return Err(malformed("record has an empty sequencer".into()));
        }
        if size < 0 {
            return Err(malformed(format!("record has a negative size: {size}")));
        }
        let original_key = decode_event_key(&key).map_err(&malformed)?;

        records.push(ObjectRef {
            container,
            original_key,
            declared_size: size as u64,
            version_token: version_id,
            sequence_token: sequencer,
        });
    }
    Ok(records)
}

use baler_core::types::EventEnvelope;
use serde_json::{Value, json};

/// Builds a single object-change record in the notification shape.
pub fn record_json(
    container: &str,
    key: &str,
    size: u64,
    sequencer: &str,
    version: Option<&str>,
) -> Value {
    let mut object = json!({ "key": key, "size": size, "sequencer": sequencer });
    if let Some(version) = version {
        object["versionId"] = json!(version);
    }
    json!({ "s3": { "bucket": { "name": container }, "object": object } })
}

/// A notification body carrying one unversioned record.
pub fn notification_body(container: &str, key: &str, size: u64, sequencer: &str) -> String {
    json!({ "Records": [record_json(container, key, size, sequencer, None)] }).to_string()
}

/// A notification body carrying one versioned record.
pub fn notification_body_versioned(
    container: &str,
    key: &str,
    size: u64,
    sequencer: &str,
    version: &str,
) -> String {
    json!({ "Records": [record_json(container, key, size, sequencer, Some(version))] }).to_string()
}

pub fn envelope(id: &str, body: impl Into<String>) -> EventEnvelope {
    EventEnvelope {
        id: id.into(),
        body: body.into(),
    }
}

//! Batch orchestration: parse envelopes, claim record identities, bundle
//! the survivors under budget, upload, and attribute failures back to
//! envelopes.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, info, warn};

use baler_bundle::{BatchContext, BundleOutcome, bundle_records};
use baler_core::envelope::parse_envelope;
use baler_core::errors::BatchError;
use baler_core::object_store::ObjectStore;
use baler_core::types::{
    BatchResult, EventEnvelope, EventPayload, ObjectRef, RecordOutcome,
};
use baler_idempotency::{ClaimOutcome, IdempotencyGuard};
use baler_telemetry::{TelemetryLabels, record_counter};

use crate::config::AppConfig;
use crate::uploader::Uploader;

/// One orchestrator per invocation scope; owns no global state. All
/// collaborators are injected so tests can swap in doubles.
pub struct BatchOrchestrator {
    config: Arc<AppConfig>,
    store: Arc<dyn ObjectStore>,
    guard: IdempotencyGuard,
}

impl BatchOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn ObjectStore>,
        guard: IdempotencyGuard,
    ) -> Self {
        Self {
            config,
            store,
            guard,
        }
    }

    fn labels(&self, ctx: &BatchContext) -> TelemetryLabels {
        TelemetryLabels::new()
            .with_environment(self.config.environment.clone())
            .with_correlation_id(ctx.invocation_id.clone())
    }

    /// Entry point for one invocation. The returned result carries the
    /// transport's partial-failure list; only a refused direct invocation
    /// surfaces as an error.
    pub async fn handle(
        &self,
        payload: EventPayload,
        ctx: BatchContext,
    ) -> Result<BatchResult, BatchError> {
        match payload {
            EventPayload::DirectInvoke { records, .. } => self.handle_direct(records, ctx).await,
            EventPayload::Batch { envelopes } => Ok(self.handle_batch(envelopes, ctx).await),
        }
    }

    /// Synthetic direct invocation: skips envelope parsing and idempotency,
    /// bundles the given records, and reports no failures. Only honored in
    /// test environments.
    async fn handle_direct(
        &self,
        records: Vec<ObjectRef>,
        ctx: BatchContext,
    ) -> Result<BatchResult, BatchError> {
        if self.config.environment != "test" {
            warn!(
                environment = %self.config.environment,
                "refusing direct invocation outside test environments"
            );
            return Err(BatchError::DirectInvokeForbidden {
                environment: self.config.environment.clone(),
            });
        }

        self.preflight(&records)?;
        let outcome = bundle_records(
            self.store.clone(),
            &records,
            &self.config.bundle_config(),
            &ctx,
        )
        .await?;
        self.upload_if_nonempty(outcome, &ctx)
            .await
            .map_err(BatchError::Upload)?;

        Ok(BatchResult {
            failed_envelope_ids: BTreeSet::new(),
            processed_records: records,
            remaining_records: Vec::new(),
        })
    }

    async fn handle_batch(&self, envelopes: Vec<EventEnvelope>, ctx: BatchContext) -> BatchResult {
        if envelopes.is_empty() {
            debug!("event carried no envelopes");
            return BatchResult::default();
        }
        let labels = self.labels(&ctx);

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut survivors: Vec<ObjectRef> = Vec::new();
        let mut envelopes_by_record: HashMap<String, HashSet<String>> = HashMap::new();
        // Envelopes that contributed at least one survivor; these are the
        // retry unit when bundling itself fails.
        let mut contributors: HashSet<String> = HashSet::new();
        let mut accepted = 0u64;
        let mut duplicates = 0u64;

        for envelope in &envelopes {
            let records = match parse_envelope(envelope) {
                Ok(records) => records,
                Err(parse_error) => {
                    warn!(envelope_id = %envelope.id, error = %parse_error, "malformed envelope");
                    failed.insert(envelope.id.clone());
                    continue;
                }
            };
            for record in records {
                let record_id = record.record_id();
                envelopes_by_record
                    .entry(record_id.clone())
                    .or_default()
                    .insert(envelope.id.clone());
                match self.guard.claim(&record_id, &record.original_key).await {
                    Ok(ClaimOutcome::New) => {
                        accepted += 1;
                        contributors.insert(envelope.id.clone());
                        survivors.push(record);
                    }
                    Ok(ClaimOutcome::Duplicate) => {
                        duplicates += 1;
                    }
                    Err(claim_error) => {
                        warn!(
                            envelope_id = %envelope.id,
                            error = %claim_error,
                            "claim store unavailable, envelope will be retried"
                        );
                        failed.insert(envelope.id.clone());
                        // Claiming the envelope's remaining records now would
                        // mark them duplicates on redelivery and lose them.
                        break;
                    }
                }
            }
        }

        if accepted > 0 {
            record_counter("NewObjectsProcessed", accepted, &labels);
        }
        if duplicates > 0 {
            record_counter("DuplicatesSkipped", duplicates, &labels);
        }

        if survivors.is_empty() {
            if failed.is_empty() {
                record_counter("DuplicateOnlyBatch", 1, &labels);
                info!("batch contained only duplicates, nothing to bundle");
            }
            return BatchResult {
                failed_envelope_ids: failed,
                ..Default::default()
            };
        }

        if let Err(preflight_error) = self.preflight(&survivors) {
            error!(
                code = preflight_error.error_code(),
                error = %preflight_error,
                "batch refused before fetch, returning contributing envelopes for retry"
            );
            failed.extend(contributors);
            return BatchResult {
                failed_envelope_ids: failed,
                processed_records: Vec::new(),
                remaining_records: survivors,
            };
        }

        let outcome = match bundle_records(
            self.store.clone(),
            &survivors,
            &self.config.bundle_config(),
            &ctx,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(bundle_error) => {
                error!(
                    code = bundle_error.error_code(),
                    retryable = bundle_error.retryable(),
                    error = %bundle_error,
                    "bundling failed, returning contributing envelopes for retry"
                );
                failed.extend(contributors);
                return BatchResult {
                    failed_envelope_ids: failed,
                    processed_records: Vec::new(),
                    remaining_records: survivors,
                };
            }
        };

        if let Some(reason) = outcome.stopped {
            info!(reason = reason.as_str(), "budget stop, shipping what fits");
        }

        let mut processed = Vec::new();
        let mut remaining = Vec::new();
        for record in survivors {
            match outcome.outcomes.get(&record.record_id()) {
                Some(RecordOutcome::Bundled) | Some(RecordOutcome::Skipped(_)) => {
                    processed.push(record);
                }
                Some(RecordOutcome::Deferred(_)) | None => remaining.push(record),
            }
        }

        let bundled = outcome.artifact.entries;
        if let Err(upload_error) = self.upload_if_nonempty(outcome, &ctx).await {
            error!(
                code = upload_error.code(),
                error = %upload_error,
                "bundle upload failed, returning contributing envelopes for retry"
            );
            failed.extend(contributors);
            let mut all_records = processed;
            all_records.append(&mut remaining);
            return BatchResult {
                failed_envelope_ids: failed,
                processed_records: Vec::new(),
                remaining_records: all_records,
            };
        }
        if bundled > 0 {
            record_counter("BundlesCreated", 1, &labels);
            record_counter("RecordsInBundle", bundled, &labels);
        }

        for record in &remaining {
            if let Some(ids) = envelopes_by_record.get(&record.record_id()) {
                failed.extend(ids.iter().cloned());
            }
        }

        info!(
            processed = processed.len(),
            remaining = remaining.len(),
            failed = failed.len(),
            "batch finished"
        );
        BatchResult {
            failed_envelope_ids: failed,
            processed_records: processed,
            remaining_records: remaining,
        }
    }

    /// Bounds the declared input bytes before any fetch begins.
    fn preflight(&self, records: &[ObjectRef]) -> Result<(), BatchError> {
        let total_bytes: u64 = records.iter().map(|record| record.declared_size).sum();
        let limit_bytes = self.config.max_bundle_input_bytes();
        if total_bytes > limit_bytes {
            return Err(BatchError::BatchTooLarge {
                total_bytes,
                limit_bytes,
            });
        }
        Ok(())
    }

    /// Uploads the artifact unless the archive came out empty; an empty
    /// bundle ships nothing.
    async fn upload_if_nonempty(
        &self,
        outcome: BundleOutcome,
        ctx: &BatchContext,
    ) -> Result<(), baler_core::object_store::ObjectStoreError> {
        if outcome.artifact.entries == 0 {
            debug!("bundle is empty, skipping upload");
            return Ok(());
        }
        let key = destination_key(&ctx.invocation_id, OffsetDateTime::now_utc());
        let uploader = Uploader::new(
            self.store.clone(),
            self.config.distribution_bucket.clone(),
            self.config.bundle_encryption_key_id.clone(),
        );
        uploader.upload(&key, outcome.artifact).await
    }
}

/// Time-partitioned destination key, unique per invocation.
fn destination_key(invocation_id: &str, now: OffsetDateTime) -> String {
    let prefix = now
        .format(format_description!("[year]/[month]/[day]/[hour]"))
        .unwrap_or_else(|_| "1970/01/01/00".into());
    format!("{prefix}/bundle-{invocation_id}.tar.gz")
}

//! Wires the fetch pool, budget governor, and archive writer into the
//! per-invocation bundling pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use baler_core::errors::BundleError;
use baler_core::object_store::ObjectStore;
use baler_core::path_safety::sanitize_object_key;
use baler_core::types::{DeferReason, ObjectRef, RecordOutcome, SkipReason};

use crate::archive::{ArchiveWriter, BundleArtifact};
use crate::fetch::{FetchPool, FetchedEntry, OutcomeSink};
use crate::governor::{BudgetGovernor, PipelineSignal, Stop, StopReason};
use crate::spool::SpoolBuffer;

/// Upper bound on draining the writer after the fetchers stop, independent
/// of the invocation deadline.
const WRITER_JOIN_CEILING: Duration = Duration::from_secs(300);
/// Slice of the remaining deadline kept back so the caller can still
/// respond after a stuck shutdown.
const JOIN_SAFETY_MARGIN: Duration = Duration::from_secs(1);
const MIN_JOIN_BUDGET: Duration = Duration::from_millis(100);

/// Pipeline tunables, resolved from configuration by the caller.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub spool_threshold_bytes: u64,
    pub max_on_disk_bytes: u64,
    pub timeout_guard: Duration,
    pub fetch_workers: usize,
    pub queue_put_timeout: Duration,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            spool_threshold_bytes: 64 * 1024 * 1024,
            max_on_disk_bytes: 400 * 1024 * 1024,
            timeout_guard: Duration::from_secs(10),
            fetch_workers: 8,
            queue_put_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-invocation context supplied by the runtime.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub invocation_id: String,
    pub deadline: Instant,
}

/// What came out of one bundling run: the finalized artifact (possibly
/// empty), how each dispatched record settled, and whether a budget cut
/// the run short.
#[derive(Debug)]
pub struct BundleOutcome {
    pub artifact: BundleArtifact,
    pub outcomes: HashMap<String, RecordOutcome>,
    pub stopped: Option<StopReason>,
}

/// Fetches the given records concurrently and streams them into a single
/// compressed, hashed archive, under the time and disk budgets carried by
/// `config` and `ctx`.
///
/// Per-record recoverable failures settle into outcomes; batch-level
/// failures (back-pressure overflow, store client errors, archive I/O)
/// abort the run and surface here as the first error observed.
pub async fn bundle_records(
    store: Arc<dyn ObjectStore>,
    records: &[ObjectRef],
    config: &BundleConfig,
    ctx: &BatchContext,
) -> Result<BundleOutcome, BundleError> {
    let governor = Arc::new(BudgetGovernor::new(
        ctx.deadline,
        config.timeout_guard,
        config.max_on_disk_bytes,
    ));
    let signal = PipelineSignal::new();
    let sink = OutcomeSink::default();

    debug!(records = records.len(), invocation_id = %ctx.invocation_id, "bundling started");

    let (tx, rx) = mpsc::channel(config.fetch_workers.max(1));
    let records: Arc<Vec<ObjectRef>> = Arc::new(records.to_vec());

    let pool = FetchPool::new(store, config.fetch_workers, config.queue_put_timeout);
    let workers = pool.spawn(
        records.clone(),
        tx,
        governor.clone(),
        signal.clone(),
        sink.clone(),
    );

    let writer_task = {
        let writer = ArchiveWriter::new(SpoolBuffer::new(config.spool_threshold_bytes));
        let governor = governor.clone();
        let signal = signal.clone();
        let sink = sink.clone();
        let spool_threshold = config.spool_threshold_bytes;
        tokio::spawn(write_entries(rx, writer, governor, signal, sink, spool_threshold))
    };

    for handle in workers {
        if handle.await.is_err() {
            sink.fail(BundleError::Aborted, &signal);
        }
    }
    // Every sender is gone now; the writer drains what is queued and
    // finalizes.

    let join_budget = governor
        .remaining()
        .saturating_sub(JOIN_SAFETY_MARGIN)
        .min(WRITER_JOIN_CEILING)
        .max(MIN_JOIN_BUDGET);
    let finalized = match tokio::time::timeout(join_budget, writer_task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            warn!(error = %join_error, "archive writer task failed");
            Err(BundleError::Aborted)
        }
        Err(_) => {
            signal.stop(Stop::Abort);
            return Err(BundleError::WriterStalled {
                timeout_ms: join_budget.as_millis() as u64,
            });
        }
    };

    if let Some(error) = sink.take_error() {
        return Err(error);
    }
    let artifact = finalized?;

    let stopped = match signal.current() {
        Some(Stop::Graceful(reason)) => Some(reason),
        Some(Stop::Abort) => return Err(BundleError::Aborted),
        None => None,
    };

    Ok(BundleOutcome {
        artifact,
        outcomes: sink.outcomes(),
        stopped,
    })
}

async fn write_entries(
    mut rx: mpsc::Receiver<FetchedEntry>,
    mut writer: ArchiveWriter,
    governor: Arc<BudgetGovernor>,
    signal: PipelineSignal,
    sink: OutcomeSink,
    spool_threshold: u64,
) -> Result<BundleArtifact, BundleError> {
    loop {
        let received = tokio::select! {
            biased;
            _ = signal.aborted() => return Err(BundleError::Aborted),
            received = rx.recv() => received,
        };
        let Some(FetchedEntry { record, mut body }) = received else {
            break;
        };

        // Budgets are re-checked per entry: records queued before a
        // graceful stop may no longer fit.
        if let Err(reason) = governor.admit_entry(writer.bytes_written(), record.declared_size) {
            signal.stop(Stop::Graceful(reason));
            sink.settle(&record, RecordOutcome::Deferred(DeferReason::BudgetStop));
            continue;
        }

        let safe_path = match sanitize_object_key(&record.original_key) {
            Ok(path) => path,
            Err(rejection) => {
                warn!(
                    key = %record.original_key,
                    code = rejection.code(),
                    error = %rejection,
                    "unsafe object key, skipping record"
                );
                sink.settle(&record, RecordOutcome::Skipped(SkipReason::UnsafeKey));
                continue;
            }
        };

        if record.declared_size < spool_threshold {
            // Small entries are buffered and length-verified before they
            // touch the archive.
            let mut content = Vec::with_capacity(record.declared_size as usize);
            let read = tokio::select! {
                biased;
                _ = signal.aborted() => return Err(BundleError::Aborted),
                read = body.read_to_end(&mut content) => read,
            };
            read?;
            if content.len() as u64 != record.declared_size {
                warn!(
                    key = %record.original_key,
                    declared = record.declared_size,
                    actual = content.len(),
                    "size mismatch between metadata and content, skipping record"
                );
                sink.settle(&record, RecordOutcome::Skipped(SkipReason::SizeMismatch));
                continue;
            }
            writer.append_buffered(&safe_path, &content)?;
        } else {
            let appended = tokio::select! {
                biased;
                _ = signal.aborted() => return Err(BundleError::Aborted),
                appended = writer.append_streamed(&safe_path, record.declared_size, &mut body) => appended,
            };
            appended?;
        }
        sink.settle(&record, RecordOutcome::Bundled);
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use baler_core::object_store::{InMemoryObjectStore, ObjectStoreError};
    use baler_testutil::unpack_bundle;
    use tokio::io::AsyncReadExt;

    fn record(key: &str, size: u64, sequencer: &str) -> ObjectRef {
        ObjectRef {
            container: "src".into(),
            original_key: key.into(),
            declared_size: size,
            version_token: None,
            sequence_token: sequencer.into(),
        }
    }

    fn ctx() -> BatchContext {
        BatchContext {
            invocation_id: "inv-1".into(),
            deadline: Instant::now() + Duration::from_secs(300),
        }
    }

    async fn read_all(artifact: &mut BundleArtifact) -> Vec<u8> {
        let mut bytes = Vec::new();
        artifact.reader.read_to_end(&mut bytes).await.unwrap();
        bytes
    }

    #[tokio::test]
    async fn bundles_fetched_records() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "a.bin", &b"file1 bytes"[..]);
        store.put("src", "d/b.log", &b"file2 bytes!"[..]);
        let records = vec![record("a.bin", 11, "000A"), record("d/b.log", 12, "000B")];

        let mut outcome = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.artifact.entries, 2);
        assert!(outcome.stopped.is_none());
        assert!(
            outcome
                .outcomes
                .values()
                .all(|settled| *settled == RecordOutcome::Bundled)
        );

        let bytes = read_all(&mut outcome.artifact).await;
        let mut names: Vec<String> =
            unpack_bundle(&bytes).into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["a.bin", "d/b.log"]);
    }

    #[tokio::test]
    async fn missing_objects_are_skipped_not_fatal() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "present.bin", &b"data"[..]);
        let records = vec![record("present.bin", 4, "01"), record("absent.bin", 4, "02")];

        let outcome = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.artifact.entries, 1);
        assert_eq!(
            outcome.outcomes.get(&records[1].record_id()),
            Some(&RecordOutcome::Skipped(SkipReason::NotFound))
        );
    }

    #[tokio::test]
    async fn throttled_records_are_deferred() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "ok.bin", &b"data"[..]);
        store.put("src", "busy.bin", &b"data"[..]);
        store.fail_get("src", "busy.bin", ObjectStoreError::Throttled);
        let records = vec![record("ok.bin", 4, "01"), record("busy.bin", 4, "02")];

        let outcome = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.artifact.entries, 1);
        assert_eq!(
            outcome.outcomes.get(&records[1].record_id()),
            Some(&RecordOutcome::Deferred(DeferReason::Throttled))
        );
    }

    #[tokio::test]
    async fn unsafe_keys_are_dropped_at_the_writer() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "folder/../../etc/passwd", &b"pw"[..]);
        let records = vec![record("folder/../../etc/passwd", 2, "01")];

        let outcome = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.artifact.entries, 0);
        assert_eq!(
            outcome.outcomes.get(&records[0].record_id()),
            Some(&RecordOutcome::Skipped(SkipReason::UnsafeKey))
        );
    }

    #[tokio::test]
    async fn size_mismatches_are_dropped_at_the_writer() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "lied.bin", &b"only-nine"[..]);
        let records = vec![record("lied.bin", 100, "01")];

        let outcome = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.artifact.entries, 0);
        assert_eq!(
            outcome.outcomes.get(&records[0].record_id()),
            Some(&RecordOutcome::Skipped(SkipReason::SizeMismatch))
        );
    }

    #[tokio::test]
    async fn disk_budget_stops_gracefully_after_what_fits() {
        let store = Arc::new(InMemoryObjectStore::new());
        let big = vec![1u8; 3 * 1024];
        let small = vec![2u8; 2 * 1024];
        store.put("src", "first.bin", big.clone());
        store.put("src", "second.bin", small);
        let records = vec![
            record("first.bin", 3 * 1024, "01"),
            record("second.bin", 2 * 1024, "02"),
        ];

        let config = BundleConfig {
            max_on_disk_bytes: 4 * 1024,
            fetch_workers: 1,
            ..BundleConfig::default()
        };
        let mut outcome = bundle_records(store, &records, &config, &ctx())
            .await
            .expect("bundle");
        assert_eq!(outcome.stopped, Some(StopReason::DiskBudget));
        assert_eq!(outcome.artifact.entries, 1);
        assert!(!outcome.outcomes.contains_key(&records[1].record_id()));

        let bytes = read_all(&mut outcome.artifact).await;
        let entries = unpack_bundle(&bytes);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "first.bin");
        assert_eq!(entries[0].1, big);
    }

    #[tokio::test]
    async fn exhausted_time_budget_ships_an_empty_bundle() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "late.bin", &b"data"[..]);
        let records = vec![record("late.bin", 4, "01")];

        let context = BatchContext {
            invocation_id: "inv-2".into(),
            deadline: Instant::now() + Duration::from_secs(2),
        };
        let outcome = bundle_records(store, &records, &BundleConfig::default(), &context)
            .await
            .expect("bundle");
        assert_eq!(outcome.stopped, Some(StopReason::TimeBudget));
        assert_eq!(outcome.artifact.entries, 0);
        assert!(outcome.outcomes.is_empty());
    }

    #[tokio::test]
    async fn client_errors_fail_the_batch() {
        let store = Arc::new(InMemoryObjectStore::new());
        store.put("src", "ok.bin", &b"data"[..]);
        store.fail_get(
            "src",
            "broken.bin",
            ObjectStoreError::Client {
                message: "connection reset".into(),
            },
        );
        store.put("src", "broken.bin", &b"data"[..]);
        let records = vec![record("ok.bin", 4, "01"), record("broken.bin", 4, "02")];

        let error = bundle_records(store, &records, &BundleConfig::default(), &ctx())
            .await
            .unwrap_err();
        assert_eq!(error.error_code(), "FETCH_FAILED");
    }
}

//! Bounded-concurrency object fetching feeding the archive writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use baler_core::errors::BundleError;
use baler_core::object_store::{ObjectBody, ObjectStore, ObjectStoreError};
use baler_core::types::{DeferReason, ObjectRef, RecordOutcome, SkipReason};
use baler_telemetry::{TelemetryLabels, record_counter};

use crate::governor::{BudgetGovernor, PipelineSignal, Stop};

/// A fetched object handed across the bounded channel to the writer.
pub(crate) struct FetchedEntry {
    pub record: ObjectRef,
    pub body: ObjectBody,
}

/// Shared settlement state: per-record outcomes plus the first batch-level
/// error. The first error wins; later ones are dropped.
#[derive(Clone, Default)]
pub(crate) struct OutcomeSink {
    outcomes: Arc<Mutex<HashMap<String, RecordOutcome>>>,
    first_error: Arc<Mutex<Option<BundleError>>>,
}

impl OutcomeSink {
    pub fn settle(&self, record: &ObjectRef, outcome: RecordOutcome) {
        lock(&self.outcomes).insert(record.record_id(), outcome);
        let metric = match outcome {
            RecordOutcome::Bundled => None,
            RecordOutcome::Skipped(reason) => Some(reason.metric()),
            RecordOutcome::Deferred(reason) => Some(reason.metric()),
        };
        if let Some(metric) = metric {
            record_counter(
                metric,
                1,
                &TelemetryLabels::new().with_container(record.container.clone()),
            );
        }
    }

    pub fn fail(&self, error: BundleError, signal: &PipelineSignal) {
        let mut slot = lock(&self.first_error);
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        signal.stop(Stop::Abort);
    }

    pub fn take_error(&self) -> Option<BundleError> {
        lock(&self.first_error).take()
    }

    pub fn outcomes(&self) -> HashMap<String, RecordOutcome> {
        lock(&self.outcomes).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// N worker tasks drawing record indices from a shared cursor. Workers end
/// when the queue drains, a stop is signalled, or the writer goes away.
pub(crate) struct FetchPool {
    store: Arc<dyn ObjectStore>,
    workers: usize,
    send_timeout: Duration,
}

impl FetchPool {
    pub fn new(store: Arc<dyn ObjectStore>, workers: usize, send_timeout: Duration) -> Self {
        Self {
            store,
            workers: workers.max(1),
            send_timeout,
        }
    }

    pub fn spawn(
        &self,
        records: Arc<Vec<ObjectRef>>,
        tx: mpsc::Sender<FetchedEntry>,
        governor: Arc<BudgetGovernor>,
        signal: PipelineSignal,
        sink: OutcomeSink,
    ) -> Vec<JoinHandle<()>> {
        let cursor = Arc::new(AtomicUsize::new(0));
        (0..self.workers)
            .map(|worker| {
                let store = self.store.clone();
                let records = records.clone();
                let cursor = cursor.clone();
                let tx = tx.clone();
                let governor = governor.clone();
                let signal = signal.clone();
                let sink = sink.clone();
                let send_timeout = self.send_timeout;
                tokio::spawn(async move {
                    fetch_worker(
                        worker,
                        store,
                        records,
                        cursor,
                        tx,
                        governor,
                        signal,
                        sink,
                        send_timeout,
                    )
                    .await;
                })
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_worker(
    worker: usize,
    store: Arc<dyn ObjectStore>,
    records: Arc<Vec<ObjectRef>>,
    cursor: Arc<AtomicUsize>,
    tx: mpsc::Sender<FetchedEntry>,
    governor: Arc<BudgetGovernor>,
    signal: PipelineSignal,
    sink: OutcomeSink,
    send_timeout: Duration,
) {
    loop {
        if signal.is_stopped() {
            return;
        }
        let index = cursor.fetch_add(1, Ordering::Relaxed);
        let Some(record) = records.get(index) else {
            return;
        };

        if let Err(reason) = governor.admit(record.declared_size) {
            debug!(
                worker,
                key = %record.original_key,
                reason = reason.as_str(),
                "budget reached, stopping dispatch"
            );
            signal.stop(Stop::Graceful(reason));
            return;
        }

        let fetched = tokio::select! {
            biased;
            _ = signal.aborted() => return,
            fetched = store.get_object(&record.container, &record.original_key) => fetched,
        };

        let body = match fetched {
            Ok(body) => body,
            Err(ObjectStoreError::NotFound { .. }) => {
                warn!(worker, key = %record.original_key, "object missing, skipping record");
                sink.settle(record, RecordOutcome::Skipped(SkipReason::NotFound));
                continue;
            }
            Err(ObjectStoreError::AccessDenied { .. }) => {
                warn!(worker, key = %record.original_key, "access denied, skipping record");
                sink.settle(record, RecordOutcome::Skipped(SkipReason::AccessDenied));
                continue;
            }
            Err(ObjectStoreError::Throttled) => {
                debug!(worker, key = %record.original_key, "throttled, deferring record");
                sink.settle(record, RecordOutcome::Deferred(DeferReason::Throttled));
                continue;
            }
            Err(ObjectStoreError::Timeout) => {
                debug!(worker, key = %record.original_key, "store timeout, deferring record");
                sink.settle(record, RecordOutcome::Deferred(DeferReason::Timeout));
                continue;
            }
            Err(error) => {
                warn!(worker, key = %record.original_key, error = %error, "object fetch failed");
                sink.fail(BundleError::Fetch(error), &signal);
                return;
            }
        };

        let entry = FetchedEntry {
            record: record.clone(),
            body,
        };
        tokio::select! {
            biased;
            _ = signal.aborted() => return,
            sent = tokio::time::timeout(send_timeout, tx.send(entry)) => match sent {
                Ok(Ok(())) => {}
                // Writer is gone; nothing left to feed.
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!(worker, key = %record.original_key, "handoff queue full, failing batch");
                    sink.fail(
                        BundleError::BackpressureOverflow {
                            waited_ms: send_timeout.as_millis() as u64,
                        },
                        &signal,
                    );
                    return;
                }
            },
        }
    }
}

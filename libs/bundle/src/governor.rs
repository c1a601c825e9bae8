//! Wall-clock and on-disk budget enforcement plus the shared stop signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Which budget ran out. A budget stop is not an error: whatever is in the
/// archive is finalized and shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TimeBudget,
    DiskBudget,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TimeBudget => "time_budget",
            StopReason::DiskBudget => "disk_budget",
        }
    }
}

/// Pipeline-wide stop state. A graceful stop lets in-flight work drain; an
/// abort short-circuits every await. Abort wins over graceful and a
/// graceful cause never changes once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Graceful(StopReason),
    Abort,
}

/// Cloneable handle to the stop state, observed by every pipeline task.
#[derive(Clone)]
pub struct PipelineSignal {
    tx: Arc<watch::Sender<Option<Stop>>>,
    rx: watch::Receiver<Option<Stop>>,
}

impl PipelineSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn stop(&self, stop: Stop) {
        self.tx.send_if_modified(|current| match (*current, stop) {
            (None, _) => {
                *current = Some(stop);
                true
            }
            (Some(Stop::Graceful(_)), Stop::Abort) => {
                *current = Some(Stop::Abort);
                true
            }
            _ => false,
        });
    }

    pub fn current(&self) -> Option<Stop> {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.current().is_some()
    }

    /// Resolves once an abort is signalled; never resolves for a graceful
    /// stop. Intended for `select!` arms guarding pipeline awaits.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if matches!(*rx.borrow_and_update(), Some(Stop::Abort)) {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for PipelineSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates the two pipeline budgets: remaining wall-clock time against a
/// guard threshold, and bytes on local disk against the scratch quota.
///
/// Remaining time derives from a caller-supplied deadline rather than
/// wall-clock arithmetic, since the caller may extend its own deadline.
pub struct BudgetGovernor {
    deadline: Instant,
    guard: Duration,
    max_on_disk: u64,
    reserved: AtomicU64,
}

impl BudgetGovernor {
    pub fn new(deadline: Instant, guard: Duration, max_on_disk: u64) -> Self {
        Self {
            deadline,
            guard,
            max_on_disk,
            reserved: AtomicU64::new(0),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Admission check before a fetcher dispatches a record: verifies the
    /// time guard and reserves the declared bytes against the disk budget.
    pub fn admit(&self, declared: u64) -> Result<(), StopReason> {
        if self.remaining() < self.guard {
            return Err(StopReason::TimeBudget);
        }
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(declared);
            if next > self.max_on_disk {
                return Err(StopReason::DiskBudget);
            }
            match self.reserved.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Re-check before the writer commits an entry, against bytes actually
    /// written rather than reservations.
    pub fn admit_entry(&self, written: u64, declared: u64) -> Result<(), StopReason> {
        if self.remaining() < self.guard {
            return Err(StopReason::TimeBudget);
        }
        if written.saturating_add(declared) > self.max_on_disk {
            return Err(StopReason::DiskBudget);
        }
        Ok(())
    }
}

//! Run-wide progress tracking with best-effort fan-out to observers.
//!
//! Workers push [`ProgressUpdate`]s; every update produces an immutable
//! [`ProgressSnapshot`] that is queued on a bounded channel and delivered to
//! all observers, in subscription order, by a dedicated delivery task.
//!
//! Delivery never applies backpressure: when the queue is full the snapshot
//! is dropped. [`ProgressTracker::close`] drains the queue and then hands the
//! final snapshot to every observer directly, so the last state of a run is
//! always seen. An observer that panics is logged and skipped.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default capacity of the delivery queue.
pub const DEFAULT_PROGRESS_BUFFER: usize = 10;

/// Point-in-time copy of the run counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Label of the most recent activity.
    pub current: String,
    pub started_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Jobs that reached a terminal state.
    pub fn done(&self) -> usize {
        self.completed + self.failed
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.done())
    }

    pub fn is_finished(&self) -> bool {
        self.done() >= self.total
    }

    /// Share of jobs in a terminal state, 0-100. Zero when there are no jobs.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.done() as f64 / self.total as f64 * 100.0
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Utc::now())
    }

    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Terminal jobs per second.
    pub fn rate(&self) -> f64 {
        self.rate_at(Utc::now())
    }

    pub fn rate_at(&self, now: DateTime<Utc>) -> f64 {
        let secs = self.elapsed_at(now).as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.done() as f64 / secs
    }

    /// Linear extrapolation of the remaining time from the average
    /// throughput so far. `None` until at least one job finished.
    pub fn eta(&self) -> Option<Duration> {
        self.eta_at(Utc::now())
    }

    pub fn eta_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        let rate = self.rate_at(now);
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.remaining() as f64 / rate))
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {:.1}% - {} - {:.1} items/sec - {}s elapsed",
            self.done(),
            self.total,
            self.percentage(),
            self.current,
            self.rate(),
            self.elapsed().as_secs()
        )
    }
}

/// Change applied by a worker to the run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub completed: usize,
    pub failed: usize,
    pub current: Option<String>,
}

impl ProgressUpdate {
    /// One more job succeeded.
    pub fn completed(label: impl Into<String>) -> Self {
        Self {
            completed: 1,
            current: Some(label.into()),
            ..Default::default()
        }
    }

    /// One more job failed.
    pub fn failed(label: impl Into<String>) -> Self {
        Self {
            failed: 1,
            current: Some(label.into()),
            ..Default::default()
        }
    }

    /// Only the activity label changes.
    pub fn current(label: impl Into<String>) -> Self {
        Self {
            current: Some(label.into()),
            ..Default::default()
        }
    }
}

/// Receives progress snapshots. Must not block for long; it runs on the
/// delivery task.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot);
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        self(snapshot)
    }
}

type Observers = Arc<RwLock<Vec<Arc<dyn ProgressObserver>>>>;

/// Thread-safe progress counters with asynchronous observer delivery.
pub struct ProgressTracker {
    state: Mutex<ProgressSnapshot>,
    observers: Observers,
    sender: Mutex<Option<mpsc::Sender<ProgressSnapshot>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl ProgressTracker {
    /// Create a tracker for `total` jobs and start its delivery task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(total: usize, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let observers: Observers = Arc::new(RwLock::new(Vec::new()));
        let delivery = tokio::spawn(delivery_loop(rx, Arc::clone(&observers)));

        Self {
            state: Mutex::new(ProgressSnapshot {
                total,
                completed: 0,
                failed: 0,
                current: String::new(),
                started_at: Utc::now(),
            }),
            observers,
            sender: Mutex::new(Some(tx)),
            delivery: Mutex::new(Some(delivery)),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register an observer. Observers are notified in subscription order.
    pub fn subscribe(&self, observer: Arc<dyn ProgressObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    /// Apply `update` and queue the resulting snapshot for delivery.
    ///
    /// Never blocks on observers: if the queue is full the snapshot is
    /// discarded.
    pub fn update(&self, update: ProgressUpdate) {
        let snapshot = {
            let mut state = lock(&self.state);
            let room = state.total.saturating_sub(state.completed + state.failed);
            let completed = update.completed.min(room);
            let failed = update.failed.min(room - completed);
            if completed != update.completed || failed != update.failed {
                tracing::warn!(
                    total = state.total,
                    completed = state.completed,
                    failed = state.failed,
                    "progress update exceeds total, clamping"
                );
            }
            state.completed += completed;
            state.failed += failed;
            if let Some(current) = update.current {
                state.current = current;
            }
            state.clone()
        };

        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let sender = lock(&self.sender);
        if let Some(tx) = sender.as_ref() {
            if tx.try_send(snapshot).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("progress queue full, snapshot dropped");
            }
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        lock(&self.state).clone()
    }

    /// Number of snapshots discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop queueing, drain pending snapshots, then deliver the final
    /// snapshot to every observer and return it.
    ///
    /// Calling `close` again returns the current snapshot without delivering
    /// it a second time.
    pub async fn close(&self) -> ProgressSnapshot {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.snapshot();
        }

        drop(lock(&self.sender).take());
        let delivery = lock(&self.delivery).take();
        if let Some(handle) = delivery {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "progress delivery task ended abnormally");
            }
        }

        let last = self.snapshot();
        notify(&self.observers, &last);
        last
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.delivery).take() {
            handle.abort();
        }
    }
}

async fn delivery_loop(mut rx: mpsc::Receiver<ProgressSnapshot>, observers: Observers) {
    while let Some(snapshot) = rx.recv().await {
        notify(&observers, &snapshot);
    }
}

/// Deliver `snapshot` to every observer in order. A panicking observer is
/// logged and skipped; the others still receive the snapshot.
fn notify(observers: &Observers, snapshot: &ProgressSnapshot) {
    for (index, observer) in observers_of(observers).into_iter().enumerate() {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.on_progress(snapshot)));
        if delivered.is_err() {
            tracing::warn!(
                observer = index,
                done = snapshot.done(),
                total = snapshot.total,
                "progress observer panicked"
            );
        }
    }
}

fn observers_of(observers: &Observers) -> Vec<Arc<dyn ProgressObserver>> {
    match observers.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

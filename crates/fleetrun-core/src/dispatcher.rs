//! Bounded concurrent dispatch of independent jobs.
//!
//! One worker task is spawned per job. A semaphore with `concurrency`
//! permits gates execution; each worker drives its job through the retry
//! engine, reports every state transition to the [`JobListener`] and the
//! [`ProgressTracker`], and the dispatcher joins all workers before folding
//! their outcomes into a [`Report`].
//!
//! A failing job never affects its siblings. `dispatch` itself only returns
//! an error for invalid configuration or when the run was cancelled.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::Instrument;

use crate::classify::DefaultClassifier;
use crate::error::{DispatchError, DispatchResult, JobError};
use crate::job::{Job, JobId, JobState};
use crate::obs::{self, DispatchSpan};
use crate::progress::{ProgressObserver, ProgressTracker, ProgressUpdate, DEFAULT_PROGRESS_BUFFER};
use crate::report::{aggregate, FailedJob, JobOutcome, Report};
use crate::retry::{run_with_retry_notify, RetryClassifier, RetryConfig};

/// Default number of simultaneously executing jobs.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Dispatch-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Maximum number of jobs executing at once. Must be at least 1.
    pub concurrency: usize,
    /// Capacity of the progress delivery queue.
    pub progress_buffer: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }
}

impl DispatchConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }
}

/// A job moving from one lifecycle state to another.
#[derive(Debug, Clone)]
pub struct JobTransition<'a> {
    pub job_id: &'a JobId,
    pub label: &'a str,
    pub from: JobState,
    pub to: JobState,
    /// Attempt number the transition belongs to; 0 before the first attempt.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Backoff delay, set when entering `RetryWait`.
    pub delay: Option<Duration>,
    /// Error behind a `RetryWait` or `Failed` transition.
    pub error: Option<&'a JobError>,
}

/// Receives dispatch lifecycle events. Injected into the [`Dispatcher`].
///
/// Callbacks run on worker tasks and must not block.
pub trait JobListener: Send + Sync {
    fn on_dispatch_started(&self, _run_id: &str, _total_jobs: usize, _concurrency: usize) {}

    fn on_transition(&self, run_id: &str, transition: &JobTransition<'_>);

    fn on_dispatch_finished(&self, _run_id: &str, _report: &Report, _cancelled: bool) {}
}

/// Forwards every event to the [`obs`] emission functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl JobListener for TracingListener {
    fn on_dispatch_started(&self, run_id: &str, total_jobs: usize, concurrency: usize) {
        obs::emit_dispatch_started(run_id, total_jobs, concurrency);
    }

    fn on_transition(&self, run_id: &str, t: &JobTransition<'_>) {
        let job_id = t.job_id.as_str();
        match t.to {
            JobState::Running => obs::emit_job_started(run_id, job_id, t.attempt),
            JobState::RetryWait => {
                let delay_ms = t.delay.map(|d| d.as_millis() as u64).unwrap_or(0);
                let error: &dyn std::fmt::Display = match t.error {
                    Some(e) => e,
                    None => &"unknown error",
                };
                obs::emit_job_retry(run_id, job_id, t.attempt, t.max_attempts, delay_ms, error);
            }
            JobState::Succeeded => obs::emit_job_finished(run_id, job_id, t.attempt, None),
            JobState::Failed => obs::emit_job_finished(
                run_id,
                job_id,
                t.attempt,
                t.error.map(|e| e as &dyn std::fmt::Display),
            ),
            JobState::Pending => {}
        }
    }

    fn on_dispatch_finished(&self, run_id: &str, report: &Report, cancelled: bool) {
        obs::emit_dispatch_finished(
            run_id,
            report.elapsed.as_millis() as u64,
            report.succeeded.len(),
            report.failed.len(),
            cancelled,
        );
    }
}

type RetryPolicyFn = dyn Fn(&Job) -> RetryConfig + Send + Sync;

/// Runs batches of jobs with bounded parallelism.
pub struct Dispatcher {
    config: DispatchConfig,
    retry_policy: Arc<RetryPolicyFn>,
    classifier: Arc<dyn RetryClassifier>,
    listener: Arc<dyn JobListener>,
    observers: Vec<Arc<dyn ProgressObserver>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            retry_policy: Arc::new(|_: &Job| RetryConfig::default()),
            classifier: Arc::new(DefaultClassifier),
            listener: Arc::new(TracingListener),
            observers: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Choose the retry configuration for each job.
    pub fn with_retry_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Job) -> RetryConfig + Send + Sync + 'static,
    {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn with_classifier(mut self, classifier: impl RetryClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn JobListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Register a progress observer for every subsequent dispatch.
    pub fn subscribe(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Token that cancels scheduling and retry waits of running dispatches.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every job to a terminal state and return the report.
    ///
    /// Returns `Err` before anything runs when the configuration is invalid,
    /// and `Err(DispatchError::Cancelled)` with the partial report when the
    /// cancellation token fired and interrupted at least one job.
    pub async fn dispatch(&self, jobs: Vec<Job>) -> DispatchResult<Report> {
        let plans = self.plan(jobs)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = DispatchSpan::new(&run_id);
        self.run(run_id, plans, &span).instrument(span.span()).await
    }

    fn plan(&self, jobs: Vec<Job>) -> DispatchResult<Vec<(Job, RetryConfig)>> {
        if self.config.concurrency == 0 {
            return Err(DispatchError::InvalidConcurrency(self.config.concurrency));
        }

        let mut seen = HashSet::with_capacity(jobs.len());
        let mut plans = Vec::with_capacity(jobs.len());
        for job in jobs {
            if !seen.insert(job.id().clone()) {
                return Err(DispatchError::DuplicateJobId(job.id().clone()));
            }
            let retry = (self.retry_policy)(&job);
            retry
                .validate()
                .map_err(|source| DispatchError::InvalidRetryConfig {
                    job_id: job.id().clone(),
                    source,
                })?;
            plans.push((job, retry));
        }
        Ok(plans)
    }

    async fn run(
        &self,
        run_id: String,
        plans: Vec<(Job, RetryConfig)>,
        span: &DispatchSpan,
    ) -> DispatchResult<Report> {
        let started = Instant::now();
        let total = plans.len();

        let tracker = Arc::new(ProgressTracker::new(total, self.config.progress_buffer));
        for observer in &self.observers {
            tracker.subscribe(Arc::clone(observer));
        }
        self.listener
            .on_dispatch_started(&run_id, total, self.config.concurrency);

        let gate = Arc::new(Semaphore::new(self.config.concurrency));
        let worker = Arc::new(Worker {
            run_id: run_id.clone(),
            classifier: Arc::clone(&self.classifier),
            listener: Arc::clone(&self.listener),
            tracker: Arc::clone(&tracker),
            cancel: self.cancel.clone(),
        });

        let mut handles = Vec::with_capacity(total);
        let mut cursors = Vec::with_capacity(total);
        for (job, retry) in plans {
            let cursor = Arc::new(JobCursor::new());
            cursors.push((
                job.id().clone(),
                job.label().to_string(),
                retry.max_attempts,
                Arc::clone(&cursor),
            ));

            let worker = Arc::clone(&worker);
            let gate = Arc::clone(&gate);
            let task = async move { worker.run_job(job, retry, gate, cursor).await };
            // Dropping `dispatch` aborts workers that are still running.
            handles.push(AbortOnDropHandle::new(tokio::spawn(
                task.instrument(span.span()),
            )));
        }

        let joined = futures::future::join_all(handles).await;

        let mut outcomes = Vec::with_capacity(total);
        for (joined, (job_id, label, max_attempts, cursor)) in joined.into_iter().zip(cursors) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let error = if e.is_panic() {
                        JobError::unknown("job panicked")
                    } else {
                        JobError::cancelled("worker task aborted")
                    };
                    worker.finish_failed(&job_id, &label, max_attempts, &cursor, error)
                }
            };
            outcomes.push((job_id, outcome));
        }

        tracker.close().await;
        let report = aggregate(outcomes).with_elapsed(started.elapsed());
        let cancelled = self.cancel.is_cancelled() && report.cancelled_count() > 0;
        self.listener.on_dispatch_finished(&run_id, &report, cancelled);

        if cancelled {
            return Err(DispatchError::Cancelled {
                report: Box::new(report),
            });
        }
        Ok(report)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

/// Current state and attempt count of one job, shared between its worker
/// and the join barrier.
struct JobCursor {
    state: Mutex<JobState>,
    attempts: AtomicU32,
}

impl JobCursor {
    fn new() -> Self {
        Self {
            state: Mutex::new(JobState::Pending),
            attempts: AtomicU32::new(0),
        }
    }

    /// Move to `to`, returning the previous state.
    fn advance(&self, to: JobState) -> JobState {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let from = *state;
        if !from.can_transition_to(to) {
            tracing::warn!(%from, %to, "unexpected job state transition");
        }
        *state = to;
        from
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }
}

/// Per-dispatch context shared by all worker tasks.
struct Worker {
    run_id: String,
    classifier: Arc<dyn RetryClassifier>,
    listener: Arc<dyn JobListener>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run_job(
        &self,
        job: Job,
        retry: RetryConfig,
        gate: Arc<Semaphore>,
        cursor: Arc<JobCursor>,
    ) -> JobOutcome {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = gate.acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            let error = JobError::cancelled("cancelled before the job was admitted");
            return self.finish_failed(job.id(), job.label(), retry.max_attempts, &cursor, error);
        };

        let executor = job.executor().as_ref();
        let (job_ref, cursor_ref) = (&job, cursor.as_ref());
        let max_attempts = retry.max_attempts;
        let op = move || {
            let attempt = cursor_ref.attempts.fetch_add(1, Ordering::AcqRel) + 1;
            self.transition(
                job_ref,
                cursor_ref,
                JobState::Running,
                attempt,
                max_attempts,
                None,
                None,
            );
            self.tracker
                .update(ProgressUpdate::current(format!("Running: {}", job_ref.label())));
            executor.execute()
        };
        let result = run_with_retry_notify(
            op,
            &retry,
            self.classifier.as_ref(),
            &self.cancel,
            move |notice| {
                self.transition(
                    job_ref,
                    cursor_ref,
                    JobState::RetryWait,
                    notice.attempt,
                    notice.max_attempts,
                    Some(notice.delay),
                    Some(notice.error),
                );
                self.tracker.update(ProgressUpdate::current(format!(
                    "Retrying {} (attempt {}/{})",
                    job_ref.label(),
                    notice.attempt + 1,
                    notice.max_attempts
                )));
            },
        )
        .await;

        match result {
            Ok(success) => {
                self.transition(
                    &job,
                    &cursor,
                    JobState::Succeeded,
                    success.attempts,
                    retry.max_attempts,
                    None,
                    None,
                );
                self.tracker.update(ProgressUpdate::completed(job.label()));
                JobOutcome::Succeeded {
                    attempts: success.attempts,
                }
            }
            Err(failure) => self.finish_failed(
                job.id(),
                job.label(),
                retry.max_attempts,
                &cursor,
                failure.error,
            ),
        }
    }

    fn finish_failed(
        &self,
        job_id: &JobId,
        label: &str,
        max_attempts: u32,
        cursor: &JobCursor,
        error: JobError,
    ) -> JobOutcome {
        let attempts = cursor.attempts();
        let from = cursor.advance(JobState::Failed);
        self.listener.on_transition(
            &self.run_id,
            &JobTransition {
                job_id,
                label,
                from,
                to: JobState::Failed,
                attempt: attempts,
                max_attempts,
                delay: None,
                error: Some(&error),
            },
        );
        self.tracker.update(ProgressUpdate::failed(label));
        JobOutcome::Failed(FailedJob { error, attempts })
    }

    #[allow(clippy::too_many_arguments)]
    fn transition(
        &self,
        job: &Job,
        cursor: &JobCursor,
        to: JobState,
        attempt: u32,
        max_attempts: u32,
        delay: Option<Duration>,
        error: Option<&JobError>,
    ) {
        let from = cursor.advance(to);
        self.listener.on_transition(
            &self.run_id,
            &JobTransition {
                job_id: job.id(),
                label: job.label(),
                from,
                to,
                attempt,
                max_attempts,
                delay,
                error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.concurrency, 3);
        assert_eq!(cfg.progress_buffer, 10);
        assert_eq!(DispatchConfig::with_concurrency(7).concurrency, 7);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let dispatcher = Dispatcher::new(DispatchConfig::with_concurrency(0));
        let jobs = vec![Job::from_fn("a", "a", || async { Ok(()) })];
        let err = dispatcher.dispatch(jobs).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConcurrency(0)));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let dispatcher = Dispatcher::default();
        let jobs = vec![
            Job::from_fn("a", "first", || async { Ok(()) }),
            Job::from_fn("a", "second", || async { Ok(()) }),
        ];
        let err = dispatcher.dispatch(jobs).await.unwrap_err();
        assert!(matches!(err, DispatchError::DuplicateJobId(id) if id.as_str() == "a"));
    }

    #[tokio::test]
    async fn test_invalid_retry_config_rejected() {
        let dispatcher = Dispatcher::default().with_retry_policy(|_| RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        let jobs = vec![Job::from_fn("a", "a", || async { Ok(()) })];
        let err = dispatcher.dispatch(jobs).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRetryConfig { .. }));
    }

    #[tokio::test]
    async fn test_empty_batch_yields_empty_report() {
        let report = Dispatcher::default().dispatch(Vec::new()).await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.is_success());
    }

    #[test]
    fn test_cursor_tracks_previous_state() {
        let cursor = JobCursor::new();
        assert_eq!(cursor.advance(JobState::Running), JobState::Pending);
        assert_eq!(cursor.advance(JobState::RetryWait), JobState::Running);
        assert_eq!(cursor.advance(JobState::Running), JobState::RetryWait);
        assert_eq!(cursor.advance(JobState::Succeeded), JobState::Running);
    }
}

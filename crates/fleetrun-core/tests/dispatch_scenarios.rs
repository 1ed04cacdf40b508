//! End-to-end dispatch behaviour: bounded parallelism, retries, partial
//! failure, panics and cancellation.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetrun_core::{
    DispatchConfig, DispatchError, Dispatcher, ErrorKind, Job, JobError, JobExecutor, JobId,
    JobListener, JobState, JobTransition, ProgressSnapshot, RetryConfig,
};
use tokio_util::sync::CancellationToken;

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: false,
    }
}

/// Job that succeeds immediately and counts its invocations.
fn counting_job(id: &str, calls: Arc<AtomicU32>) -> Job {
    Job::from_fn(id, format!("job {id}"), move || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Job that fails with `error` for the first `failures` invocations.
fn flaky_job(id: &str, failures: u32, error: JobError, calls: Arc<AtomicU32>) -> Job {
    Job::from_fn(id, format!("job {id}"), move || {
        let calls = Arc::clone(&calls);
        let error = error.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(error)
            } else {
                Ok(())
            }
        }
    })
}

#[derive(Default)]
struct RecordingListener {
    transitions: Mutex<Vec<(JobId, JobState, JobState, u32)>>,
}

impl RecordingListener {
    fn transitions(&self) -> Vec<(JobId, JobState, JobState, u32)> {
        self.transitions.lock().unwrap().clone()
    }

    fn count_to(&self, state: JobState) -> usize {
        self.transitions()
            .iter()
            .filter(|(_, _, to, _)| *to == state)
            .count()
    }
}

impl JobListener for RecordingListener {
    fn on_transition(&self, _run_id: &str, t: &JobTransition<'_>) {
        self.transitions
            .lock()
            .unwrap()
            .push((t.job_id.clone(), t.from, t.to, t.attempt));
    }
}

/// Cancels the token as soon as any job enters a backoff wait.
struct CancelOnRetry {
    cancel: CancellationToken,
}

impl JobListener for CancelOnRetry {
    fn on_transition(&self, _run_id: &str, t: &JobTransition<'_>) {
        if t.to == JobState::RetryWait {
            self.cancel.cancel();
        }
    }
}

#[tokio::test]
async fn test_all_jobs_succeed_once() {
    let calls: Vec<Arc<AtomicU32>> = (0..5).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let jobs = calls
        .iter()
        .enumerate()
        .map(|(i, c)| counting_job(&format!("j{i}"), Arc::clone(c)))
        .collect();

    let report = Dispatcher::new(DispatchConfig::with_concurrency(2))
        .dispatch(jobs)
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 5);
    assert!(report.failed.is_empty());
    for c in &calls {
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }
    assert!(report.attempts.values().all(|&a| a == 1));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_is_respected() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let jobs: Vec<Job> = (0..12)
        .map(|i| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            Job::from_fn(format!("j{i}"), "sleepy", move || {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        })
        .collect();

    let report = Dispatcher::new(DispatchConfig::with_concurrency(3))
        .dispatch(jobs)
        .await
        .unwrap();

    assert_eq!(report.total(), 12);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_error_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let listener = Arc::new(RecordingListener::default());
    let job = flaky_job("b", 2, JobError::network("connection reset"), Arc::clone(&calls));

    let report = Dispatcher::default()
        .with_retry_policy(|_| fast_retry(3))
        .with_listener(listener.clone())
        .dispatch(vec![job])
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(report.succeeded.contains(&JobId::new("b")));
    assert_eq!(report.attempts[&JobId::new("b")], 3);
    assert_eq!(listener.count_to(JobState::RetryWait), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_fails_without_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let listener = Arc::new(RecordingListener::default());
    let job = flaky_job("c", u32::MAX, JobError::validation("bad input"), Arc::clone(&calls));

    let report = Dispatcher::default()
        .with_retry_policy(|_| fast_retry(5))
        .with_listener(listener.clone())
        .dispatch(vec![job])
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let failed = &report.failed[&JobId::new("c")];
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error.kind(), ErrorKind::Validation);
    assert_eq!(listener.count_to(JobState::RetryWait), 0);
}

#[tokio::test(start_paused = true)]
async fn test_one_permanent_failure_does_not_stop_siblings() {
    let calls: Vec<Arc<AtomicU32>> = (0..4).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let jobs = vec![
        counting_job("j1", Arc::clone(&calls[0])),
        flaky_job("j2", u32::MAX, JobError::network("unreachable"), Arc::clone(&calls[1])),
        counting_job("j3", Arc::clone(&calls[2])),
        counting_job("j4", Arc::clone(&calls[3])),
    ];

    let report = Dispatcher::new(DispatchConfig::with_concurrency(1))
        .with_retry_policy(|_| fast_retry(2))
        .dispatch(jobs)
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[&JobId::new("j2")];
    assert_eq!(failed.attempts, 2);
    assert_eq!(calls[1].load(Ordering::SeqCst), 2);
    assert_eq!(calls[2].load(Ordering::SeqCst), 1);
    assert_eq!(calls[3].load(Ordering::SeqCst), 1);
    assert_eq!(
        failed.error.details(),
        Some("operation failed after 2 attempts")
    );

    let summary = report.failure().unwrap().to_string();
    assert!(summary.starts_with("1 of 4 jobs failed"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_returns_promptly() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let job = flaky_job("e", u32::MAX, JobError::network("timeout"), Arc::clone(&calls));

    let started = tokio::time::Instant::now();
    let err = Dispatcher::default()
        .with_retry_policy(|_| RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        })
        .with_cancellation(cancel.clone())
        .with_listener(Arc::new(CancelOnRetry { cancel }))
        .dispatch(vec![job])
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let report = err.partial_report().expect("cancelled dispatch carries a report");
    assert_eq!(report.total(), 1);
    let failed = &report.failed[&JobId::new("e")];
    assert_eq!(failed.error.kind(), ErrorKind::Cancelled);
    assert_eq!(failed.attempts, 1);
    assert!(failed.error.context().contains_key("last_error"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_fails_jobs_never_admitted() {
    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = vec![
        flaky_job("first", u32::MAX, JobError::network("timeout"), Arc::new(AtomicU32::new(0))),
        counting_job("second", Arc::clone(&calls)),
        counting_job("third", Arc::clone(&calls)),
    ];

    let err = Dispatcher::new(DispatchConfig::with_concurrency(1))
        .with_retry_policy(|_| RetryConfig {
            base_delay: Duration::from_secs(30),
            jitter: false,
            ..RetryConfig::default()
        })
        .with_cancellation(cancel.clone())
        .with_listener(Arc::new(CancelOnRetry { cancel }))
        .dispatch(jobs)
        .await
        .unwrap_err();

    let report = match err {
        DispatchError::Cancelled { report } => report,
        other => panic!("expected cancellation, got {other}"),
    };
    assert_eq!(report.total(), 3);
    assert_eq!(report.cancelled_count(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.failed[&JobId::new("second")].attempts, 0);
}

struct Exploding;

#[async_trait]
impl JobExecutor for Exploding {
    async fn execute(&self) -> Result<(), JobError> {
        panic!("job body exploded")
    }
}

#[tokio::test]
async fn test_panicking_job_is_contained() {
    let calls = Arc::new(AtomicU32::new(0));
    let jobs = vec![
        Job::new("boom", "panics", Arc::new(Exploding)),
        counting_job("after", Arc::clone(&calls)),
    ];

    let report = Dispatcher::new(DispatchConfig::with_concurrency(1))
        .dispatch(jobs)
        .await
        .unwrap();

    assert_eq!(report.total(), 2);
    let failed = &report.failed[&JobId::new("boom")];
    assert_eq!(failed.error.kind(), ErrorKind::Unknown);
    assert_eq!(failed.error.message(), "job panicked");
    assert_eq!(failed.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_follow_state_machine() {
    let listener = Arc::new(RecordingListener::default());
    let jobs = vec![
        flaky_job("x", 1, JobError::rate_limit("429"), Arc::new(AtomicU32::new(0))),
        flaky_job("y", u32::MAX, JobError::auth("denied"), Arc::new(AtomicU32::new(0))),
        counting_job("z", Arc::new(AtomicU32::new(0))),
    ];

    Dispatcher::default()
        .with_retry_policy(|_| fast_retry(3))
        .with_listener(listener.clone())
        .dispatch(jobs)
        .await
        .unwrap();

    let transitions = listener.transitions();
    for (id, from, to, _) in &transitions {
        assert!(from.can_transition_to(*to), "{id}: {from} -> {to}");
    }
    let terminal = transitions.iter().filter(|(_, _, to, _)| to.is_terminal()).count();
    assert_eq!(terminal, 3);
}

#[tokio::test]
async fn test_observers_receive_final_snapshot() {
    let seen: Arc<Mutex<Vec<ProgressSnapshot>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let jobs = (0..6)
        .map(|i| counting_job(&format!("j{i}"), Arc::new(AtomicU32::new(0))))
        .collect();

    Dispatcher::default()
        .subscribe(Arc::new(move |s: &ProgressSnapshot| {
            sink.lock().unwrap().push(s.clone())
        }))
        .dispatch(jobs)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    let last = seen.last().expect("final snapshot delivered");
    assert_eq!(last.total, 6);
    assert_eq!(last.completed, 6);
    assert!(last.is_finished());
}

#[tokio::test]
async fn test_panicking_observer_keeps_the_report() {
    let jobs = vec![
        counting_job("a", Arc::new(AtomicU32::new(0))),
        flaky_job("b", u32::MAX, JobError::auth("denied"), Arc::new(AtomicU32::new(0))),
    ];

    let report = Dispatcher::default()
        .subscribe(Arc::new(|s: &ProgressSnapshot| {
            if s.is_finished() {
                panic!("renderer crashed on the last frame");
            }
        }))
        .dispatch(jobs)
        .await
        .unwrap();

    assert!(report.succeeded.contains(&JobId::new("a")));
    assert!(report.failed.contains_key(&JobId::new("b")));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_dispatch_stops_its_workers() {
    let finished = Arc::new(AtomicU32::new(0));
    let jobs = (0..3)
        .map(|i| {
            let finished = Arc::clone(&finished);
            Job::from_fn(format!("slow{i}"), "slow", move || {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        })
        .collect();

    let dispatcher = Dispatcher::default();
    let outcome = tokio::time::timeout(Duration::from_secs(1), dispatcher.dispatch(jobs)).await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_per_job_policy_selection() {
    let network_calls = Arc::new(AtomicU32::new(0));
    let plain_calls = Arc::new(AtomicU32::new(0));
    let jobs = vec![
        flaky_job("net", u32::MAX, JobError::network("down"), Arc::clone(&network_calls))
            .with_policy("network"),
        flaky_job("plain", u32::MAX, JobError::network("down"), Arc::clone(&plain_calls)),
    ];

    let report = Dispatcher::default()
        .with_retry_policy(|job| match job.policy() {
            Some("network") => RetryConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..fast_retry(4)
            },
            _ => RetryConfig::no_retry(),
        })
        .dispatch(jobs)
        .await
        .unwrap();

    assert_eq!(network_calls.load(Ordering::SeqCst), 4);
    assert_eq!(plain_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.failed.len(), 2);
}

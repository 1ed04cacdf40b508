//! fleetrun core library
//!
//! Runs batches of independent, fallible jobs with bounded parallelism,
//! retries transient failures with exponential backoff, reports progress to
//! observers and folds every outcome into one end-of-run report.

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod obs;
pub mod progress;
pub mod report;
pub mod retry;
pub mod telemetry;

pub use classify::{AlwaysRetry, DefaultClassifier, NeverRetry};

pub use dispatcher::{
    DispatchConfig, Dispatcher, JobListener, JobTransition, TracingListener, DEFAULT_CONCURRENCY,
};

pub use error::{DispatchError, DispatchResult, ErrorKind, JobError, RetryConfigError};

pub use job::{Job, JobExecutor, JobId, JobState};

pub use progress::{
    ProgressObserver, ProgressSnapshot, ProgressTracker, ProgressUpdate, DEFAULT_PROGRESS_BUFFER,
};

pub use report::{
    aggregate, render_report_md, write_report_json, BatchFailure, FailedJob, JobOutcome, Report,
};

pub use retry::{
    compute_delay, jittered_delay, run_with_retry, run_with_retry_notify, RetryClass,
    RetryClassifier, RetryConfig, RetryFailure, RetryNotice, RetryPreset, RetrySuccess,
};

pub use telemetry::init_tracing;

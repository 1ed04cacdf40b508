//! Structured observability hooks for dispatch lifecycle events.
//!
//! This module provides:
//! - A dispatch-scoped tracing span via [`DispatchSpan`]
//! - Emission functions for the lifecycle events of a dispatch and its jobs
//!
//! Events are emitted at `info!` level except retries and failures, which
//! are `warn!`. Filter with `RUST_LOG`, e.g. `RUST_LOG=fleetrun_core=debug`.

use std::fmt::Display;

use tracing::{info, warn};

/// Span tagged with the `run_id` of one dispatch.
///
/// Worker tasks are instrumented with a clone of the span, so every event a
/// job emits carries the run it belongs to.
///
/// # Example
///
/// ```ignore
/// let span = DispatchSpan::new("3f1c...");
/// tokio::spawn(work.instrument(span.span()));
/// ```
#[derive(Debug, Clone)]
pub struct DispatchSpan {
    span: tracing::Span,
}

impl DispatchSpan {
    pub fn new(run_id: &str) -> Self {
        Self {
            span: tracing::info_span!("fleetrun.dispatch", run_id = %run_id),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    /// Enter the span on the current thread. Do not hold across `.await`.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

/// Emit event: dispatch accepted its jobs.
pub fn emit_dispatch_started(run_id: &str, total_jobs: usize, concurrency: usize) {
    info!(
        event = "dispatch.started",
        run_id = %run_id,
        total_jobs = total_jobs,
        concurrency = concurrency,
    );
}

/// Emit event: a job attempt began executing.
pub fn emit_job_started(run_id: &str, job_id: &str, attempt: u32) {
    info!(event = "job.started", run_id = %run_id, job_id = %job_id, attempt = attempt);
}

/// Emit event: a job attempt failed and will be retried after `delay_ms`.
pub fn emit_job_retry(
    run_id: &str,
    job_id: &str,
    attempt: u32,
    max_attempts: u32,
    delay_ms: u64,
    error: &dyn Display,
) {
    warn!(
        event = "job.retry",
        run_id = %run_id,
        job_id = %job_id,
        attempt = attempt,
        max_attempts = max_attempts,
        delay_ms = delay_ms,
        error = %error,
    );
}

/// Emit event: a job reached a terminal state.
pub fn emit_job_finished(run_id: &str, job_id: &str, attempts: u32, error: Option<&dyn Display>) {
    match error {
        None => info!(
            event = "job.finished",
            run_id = %run_id,
            job_id = %job_id,
            attempts = attempts,
            success = true,
        ),
        Some(error) => warn!(
            event = "job.finished",
            run_id = %run_id,
            job_id = %job_id,
            attempts = attempts,
            success = false,
            error = %error,
        ),
    }
}

/// Emit event: dispatch joined all workers.
pub fn emit_dispatch_finished(
    run_id: &str,
    duration_ms: u64,
    succeeded: usize,
    failed: usize,
    cancelled: bool,
) {
    info!(
        event = "dispatch.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        succeeded = succeeded,
        failed = failed,
        cancelled = cancelled,
    );
}

//! Job model: identity, executor and per-job state machine.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Identifier of a job within one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The unit of work behind a job.
///
/// The orchestrator only observes the outcome; how the work is done (a
/// process, an HTTP call, a file copy) is up to the implementor.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobExecutor for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn execute(&self) -> Result<(), JobError> {
        (self)().await
    }
}

/// One independent unit of work submitted for dispatch.
#[derive(Clone)]
pub struct Job {
    id: JobId,
    label: String,
    policy: Option<String>,
    executor: Arc<dyn JobExecutor>,
}

impl Job {
    pub fn new(
        id: impl Into<JobId>,
        label: impl Into<String>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            policy: None,
            executor,
        }
    }

    /// Build a job from an async closure.
    pub fn from_fn<F, Fut>(id: impl Into<JobId>, label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self::new(id, label, Arc::new(f))
    }

    /// Tag the job with a retry policy key, read by the dispatcher's
    /// retry policy function.
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    pub fn executor(&self) -> &Arc<dyn JobExecutor> {
        &self.executor
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Lifecycle state of a job, owned by the worker executing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for an admission permit.
    Pending,
    /// Executor is running.
    Running,
    /// Failed with a retryable error, waiting out the backoff delay.
    RetryWait,
    Succeeded,
    Failed,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) |
            (Running, Succeeded) | (Running, RetryWait) | (Running, Failed) |
            (RetryWait, Running) | (RetryWait, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetryWait => "retry_wait",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

//! Error taxonomy for job execution and dispatch.
//!
//! A single structured [`JobError`] carries its [`ErrorKind`] as a field, so
//! classifiers match on the kind by value instead of inspecting error types.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::job::JobId;
use crate::report::Report;

/// Category of a job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    /// Rate limiting or quota exhaustion on a remote service.
    RateLimit,
    Validation,
    Auth,
    Filesystem,
    /// An external process or tool failed.
    ExternalTool,
    /// The run was cancelled before this job could finish.
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Filesystem => "filesystem",
            Self::ExternalTool => "external_tool",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Structured failure of a single job.
///
/// Cheap to clone: the optional cause is reference counted.
#[derive(Debug, Clone)]
pub struct JobError {
    kind: ErrorKind,
    message: String,
    cause: Option<Cause>,
    details: Option<String>,
    context: BTreeMap<String, String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            details: None,
            context: BTreeMap::new(),
        }
    }

    /// Wrap an underlying error with a kind and a message.
    pub fn wrap<E>(kind: ErrorKind, message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Arc::new(cause)),
            ..Self::new(kind, message)
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Filesystem, message)
    }

    pub fn external_tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalTool, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Attach a free-form detail line (e.g. captured stderr). Lines added
    /// later are appended below earlier ones.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let details = details.into();
        self.details = Some(match self.details.take() {
            Some(existing) => format!("{existing}\n{details}"),
            None => details,
        });
        self
    }

    /// Attach a key/value pair of diagnostic context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Message, details and context joined for display to a person.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.message.clone()];
        if let Some(details) = &self.details {
            parts.push(details.clone());
        }
        for (key, value) in &self.context {
            parts.push(format!("{key}: {value}"));
        }
        parts.join(" - ")
    }

    /// One-line remediation hint for the error kind.
    pub fn user_hint(&self) -> &'static str {
        match self.kind {
            ErrorKind::Network => "Network error. Check your connection and try again.",
            ErrorKind::RateLimit => "Rate limit or quota exceeded. Wait before retrying the run.",
            ErrorKind::Validation => "Invalid input. Check the job definition and parameters.",
            ErrorKind::Auth => "Authentication failed. Refresh your credentials.",
            ErrorKind::Filesystem => "File system error. Check permissions and free disk space.",
            ErrorKind::ExternalTool => {
                "External tool error. Ensure the tool is installed and on PATH."
            }
            ErrorKind::Cancelled => "The run was cancelled before this job finished.",
            ErrorKind::Unknown => "Unexpected error. Re-run with --verbose for details.",
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl Serialize for JobError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("JobError", 5)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("cause", &self.cause.as_ref().map(|c| c.to_string()))?;
        state.serialize_field("details", &self.details)?;
        state.serialize_field("context", &self.context)?;
        state.end()
    }
}

/// Invalid retry configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("multiplier must be a finite value >= 1, got {0}")]
    InvalidMultiplier(f64),

    #[error("base_delay {base:?} exceeds max_delay {max:?}")]
    BaseExceedsMax {
        base: std::time::Duration,
        max: std::time::Duration,
    },
}

/// Errors that abort a whole dispatch.
///
/// Individual job failures never appear here; they are contained in the
/// [`Report`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("concurrency must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("duplicate job id: {0}")]
    DuplicateJobId(JobId),

    #[error("invalid retry config for job {job_id}: {source}")]
    InvalidRetryConfig {
        job_id: JobId,
        #[source]
        source: RetryConfigError,
    },

    #[error("dispatch cancelled: {} of {} jobs did not succeed", .report.failed.len(), .report.total())]
    Cancelled { report: Box<Report> },
}

impl DispatchError {
    /// The partial report of a cancelled dispatch, if any.
    pub fn partial_report(&self) -> Option<&Report> {
        match self {
            Self::Cancelled { report } => Some(report),
            _ => None,
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err = JobError::wrap(ErrorKind::Network, "fetch failed", io);
        assert_eq!(err.to_string(), "[network] fetch failed: read timed out");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_describe_joins_details_and_context() {
        let err = JobError::external_tool("tool exited with 2")
            .with_details("stderr: boom")
            .with_context("job", "a1");
        assert_eq!(err.describe(), "tool exited with 2 - stderr: boom - job: a1");
    }

    #[test]
    fn test_serialize_renders_cause_as_string() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = JobError::wrap(ErrorKind::Filesystem, "open failed", io);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "filesystem");
        assert_eq!(json["cause"], "missing");
        assert!(json["details"].is_null());
    }

    #[test]
    fn test_user_hint_per_kind() {
        assert!(JobError::auth("x").user_hint().contains("credentials"));
        assert!(JobError::rate_limit("x").user_hint().contains("quota"));
    }

    #[test]
    fn test_invalid_concurrency_display() {
        let err = DispatchError::InvalidConcurrency(0);
        assert!(err.to_string().contains("at least 1"));
        assert!(err.partial_report().is_none());
    }
}

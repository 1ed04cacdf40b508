//! Built-in retry classifiers.
//!
//! Retryability is a property of the error kind plus its message. These
//! classifiers are conveniences; the retry engine accepts any
//! [`RetryClassifier`].

use crate::error::{ErrorKind, JobError};
use crate::retry::{RetryClass, RetryClassifier};

/// Message fragments that mark an external tool failure as transient.
const TRANSIENT_TOOL_PATTERNS: &[&str] = &["timeout", "connection", "network", "temporary"];

/// Message fragments that mark an unclassified failure as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "connection",
    "network",
    "temporary",
    "rate limit",
    "quota",
    "server error",
    "service unavailable",
];

/// Kind-based classification with message pattern fallbacks.
///
/// | kind            | verdict                                      |
/// |-----------------|----------------------------------------------|
/// | `Network`       | retryable                                    |
/// | `RateLimit`     | retryable                                    |
/// | `ExternalTool`  | retryable if the message looks transient     |
/// | `Unknown`       | retryable if the message looks transient     |
/// | everything else | fatal                                        |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl RetryClassifier for DefaultClassifier {
    fn classify(&self, error: &JobError) -> RetryClass {
        let retryable = match error.kind() {
            ErrorKind::Network | ErrorKind::RateLimit => true,
            ErrorKind::ExternalTool => mentions_any(error, TRANSIENT_TOOL_PATTERNS),
            ErrorKind::Unknown => mentions_any(error, TRANSIENT_PATTERNS),
            ErrorKind::Validation
            | ErrorKind::Auth
            | ErrorKind::Filesystem
            | ErrorKind::Cancelled => false,
        };
        if retryable {
            RetryClass::Retryable
        } else {
            RetryClass::Fatal
        }
    }
}

/// Retries everything except cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryClassifier for AlwaysRetry {
    fn classify(&self, error: &JobError) -> RetryClass {
        if error.is_cancelled() {
            RetryClass::Fatal
        } else {
            RetryClass::Retryable
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryClassifier for NeverRetry {
    fn classify(&self, _error: &JobError) -> RetryClass {
        RetryClass::Fatal
    }
}

fn mentions_any(error: &JobError, patterns: &[&str]) -> bool {
    let rendered = error.to_string().to_lowercase();
    patterns.iter().any(|p| rendered.contains(p))
}

//! Retry policy engine: bounded attempts, exponential backoff, jitter.
//!
//! The engine decides *how* to back off. *What* is worth retrying is decided
//! by a [`RetryClassifier`] supplied by the caller, so one engine serves
//! network calls, API calls and external processes with different
//! tolerances.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{JobError, RetryConfigError};

/// Largest perturbation applied by jitter, as a fraction of the delay.
pub const JITTER_FRACTION: f64 = 0.25;

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Upper bound for any computed delay.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Perturb each delay uniformly within ±25 %.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Tuned for flaky network operations.
    pub fn network() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Tuned for remote API calls.
    pub fn api() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 1.5,
            jitter: false,
        }
    }

    /// Tuned for long-running downloads: few attempts, long pauses.
    pub fn download() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Run exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.max_attempts == 0 {
            return Err(RetryConfigError::ZeroAttempts);
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(RetryConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.base_delay > self.max_delay {
            return Err(RetryConfigError::BaseExceedsMax {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Named [`RetryConfig`] presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    #[default]
    Default,
    Network,
    Api,
    Download,
    None,
}

impl RetryPreset {
    pub const ALL: [RetryPreset; 5] = [
        RetryPreset::Default,
        RetryPreset::Network,
        RetryPreset::Api,
        RetryPreset::Download,
        RetryPreset::None,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Network => "network",
            Self::Api => "api",
            Self::Download => "download",
            Self::None => "none",
        }
    }

    pub fn config(&self) -> RetryConfig {
        match self {
            Self::Default => RetryConfig::default(),
            Self::Network => RetryConfig::network(),
            Self::Api => RetryConfig::api(),
            Self::Download => RetryConfig::download(),
            Self::None => RetryConfig::no_retry(),
        }
    }
}

impl fmt::Display for RetryPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RetryPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|p| p.name()).collect();
                format!("unknown retry policy '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

/// Verdict of a [`RetryClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    Retryable,
    Fatal,
}

/// Decides whether a failed attempt is worth another try.
pub trait RetryClassifier: Send + Sync {
    fn classify(&self, error: &JobError) -> RetryClass;
}

impl<F> RetryClassifier for F
where
    F: Fn(&JobError) -> RetryClass + Send + Sync,
{
    fn classify(&self, error: &JobError) -> RetryClass {
        self(error)
    }
}

/// Emitted before each backoff wait.
#[derive(Debug, Clone)]
pub struct RetryNotice<'a> {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: &'a JobError,
}

/// Successful outcome of [`run_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySuccess {
    pub attempts: u32,
}

/// Terminal failure of [`run_with_retry`]: the last error and how many
/// attempts were made.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryFailure {
    #[source]
    pub error: JobError,
    pub attempts: u32,
}

/// Backoff delay before attempt `attempt + 1`, without jitter.
///
/// `min(base_delay * multiplier^(attempt-1), max_delay)`.
pub fn compute_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = config.base_delay.as_secs_f64() * config.multiplier.powi(exponent);
    if raw.is_nan() || raw <= 0.0 {
        return Duration::ZERO;
    }
    if raw >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::try_from_secs_f64(raw).map_or(config.max_delay, |d| d.min(config.max_delay))
}

/// Backoff delay with jitter applied when the config enables it.
///
/// The perturbation is uniform in ±25 % and the result is clamped to
/// `[0, max_delay]`.
pub fn jittered_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let delay = compute_delay(attempt, config);
    if !config.jitter || delay.is_zero() {
        return delay;
    }
    let factor = rand::rng().random_range(-JITTER_FRACTION..=JITTER_FRACTION);
    apply_jitter(delay, factor, config.max_delay)
}

fn apply_jitter(delay: Duration, factor: f64, max_delay: Duration) -> Duration {
    let secs = (delay.as_secs_f64() * (1.0 + factor)).max(0.0);
    // Near Duration::MAX the scaled value no longer fits.
    Duration::try_from_secs_f64(secs).map_or(max_delay, |d| d.min(max_delay))
}

/// Run `op` until it succeeds, hits a fatal error, exhausts
/// `config.max_attempts`, or `cancel` fires.
pub async fn run_with_retry<F, Fut, C>(
    op: F,
    config: &RetryConfig,
    classifier: &C,
    cancel: &CancellationToken,
) -> Result<RetrySuccess, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), JobError>>,
    C: RetryClassifier + ?Sized,
{
    run_with_retry_notify(op, config, classifier, cancel, |_| {}).await
}

/// Like [`run_with_retry`], calling `on_retry` before every backoff wait.
pub async fn run_with_retry_notify<F, Fut, C, N>(
    mut op: F,
    config: &RetryConfig,
    classifier: &C,
    cancel: &CancellationToken,
    mut on_retry: N,
) -> Result<RetrySuccess, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), JobError>>,
    C: RetryClassifier + ?Sized,
    N: FnMut(&RetryNotice<'_>),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure {
                error: JobError::cancelled("cancelled before attempt started"),
                attempts: attempt,
            });
        }

        attempt += 1;
        let error = match op().await {
            Ok(()) => return Ok(RetrySuccess { attempts: attempt }),
            Err(e) => e,
        };

        if classifier.classify(&error) == RetryClass::Fatal {
            tracing::debug!(attempt, error = %error, "fatal error, not retrying");
            return Err(RetryFailure {
                error,
                attempts: attempt,
            });
        }

        if attempt >= max_attempts {
            let error = if max_attempts > 1 {
                error.with_details(format!("operation failed after {attempt} attempts"))
            } else {
                error
            };
            return Err(RetryFailure {
                error,
                attempts: attempt,
            });
        }

        let delay = jittered_delay(attempt, config);
        tracing::debug!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, backing off"
        );
        on_retry(&RetryNotice {
            attempt,
            max_attempts,
            delay,
            error: &error,
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryFailure {
                    error: JobError::cancelled(format!(
                        "cancelled during backoff after attempt {attempt}"
                    ))
                    .with_context("last_error", &error),
                    attempts: attempt,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

//! Error aggregation: per-job outcomes folded into one end-of-run [`Report`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::error::{ErrorKind, JobError};
use crate::job::JobId;

/// Terminal failure of one job after retries.
#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub error: JobError,
    /// Executor invocations made; zero when the job never started.
    pub attempts: u32,
}

/// Terminal outcome of one job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded { attempts: u32 },
    Failed(FailedJob),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts } => *attempts,
            Self::Failed(failed) => failed.attempts,
        }
    }
}

/// Final partition of a run into succeeded and failed jobs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub succeeded: BTreeSet<JobId>,
    pub failed: BTreeMap<JobId, FailedJob>,
    /// Attempts used by each successful job.
    pub attempts: BTreeMap<JobId, u32>,
    #[serde(rename = "elapsed_ms", serialize_with = "millis")]
    pub elapsed: Duration,
}

impl Report {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failed jobs whose terminal error is a cancellation.
    pub fn cancelled_count(&self) -> usize {
        self.failed
            .values()
            .filter(|f| f.error.kind() == ErrorKind::Cancelled)
            .count()
    }

    /// Composite error for human-facing surfaces, `None` when every job
    /// succeeded.
    pub fn failure(&self) -> Option<BatchFailure> {
        if self.is_success() {
            return None;
        }
        Some(BatchFailure {
            failed: self.failed.len(),
            total: self.total(),
            causes: self
                .failed
                .iter()
                .map(|(id, f)| format!("{id} ({} attempt(s)): {}", f.attempts, f.error))
                .collect(),
        })
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// Fold per-job outcomes into a [`Report`].
pub fn aggregate<I>(results: I) -> Report
where
    I: IntoIterator<Item = (JobId, JobOutcome)>,
{
    let mut report = Report::default();
    for (id, outcome) in results {
        match outcome {
            JobOutcome::Succeeded { attempts } => {
                report.attempts.insert(id.clone(), attempts);
                report.succeeded.insert(id);
            }
            JobOutcome::Failed(failed) => {
                report.failed.insert(id, failed);
            }
        }
    }
    report
}

/// "K of N jobs failed" plus one line per failed job.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub failed: usize,
    pub total: usize,
    pub causes: Vec<String>,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} jobs failed", self.failed, self.total)?;
        for cause in &self.causes {
            write!(f, "\n  - {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}

/// Render a markdown summary of a run.
pub fn render_report_md(report: &Report) -> String {
    let mut out = String::new();
    out.push_str("# Run Report\n\n");
    out.push_str(&format!(
        "- total: {}\n- succeeded: {}\n- failed: {}\n- elapsed: {:.1}s\n",
        report.total(),
        report.succeeded.len(),
        report.failed.len(),
        report.elapsed.as_secs_f64()
    ));

    if !report.failed.is_empty() {
        out.push_str("\n## Failures\n");
        for (id, failed) in &report.failed {
            out.push_str(&format!(
                "- `{}` ({} attempt(s)): {}\n",
                id, failed.attempts, failed.error
            ));
            if let Some(details) = failed.error.details() {
                out.push_str(&format!("  - {}\n", details));
            }
        }
    }
    out
}

/// Write the report as pretty JSON.
pub fn write_report_json(path: &Path, report: &Report) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        aggregate(vec![
            (JobId::new("a"), JobOutcome::Succeeded { attempts: 1 }),
            (
                JobId::new("b"),
                JobOutcome::Failed(FailedJob {
                    error: JobError::network("connection reset").with_details("after 2 attempts"),
                    attempts: 2,
                }),
            ),
            (JobId::new("c"), JobOutcome::Succeeded { attempts: 3 }),
        ])
    }

    #[test]
    fn test_aggregate_partitions_outcomes() {
        let report = sample();
        assert_eq!(report.total(), 3);
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.attempts[&JobId::new("c")], 3);
        assert_eq!(report.failed[&JobId::new("b")].attempts, 2);
        assert!(!report.is_success());
    }

    #[test]
    fn test_failure_summary_counts_and_lists_causes() {
        let failure = sample().failure().unwrap();
        let text = failure.to_string();
        assert!(text.starts_with("1 of 3 jobs failed"));
        assert!(text.contains("b (2 attempt(s)): [network] connection reset"));
    }

    #[test]
    fn test_no_failure_when_all_succeed() {
        let report = aggregate(vec![(JobId::new("a"), JobOutcome::Succeeded { attempts: 1 })]);
        assert!(report.failure().is_none());
        assert_eq!(report.cancelled_count(), 0);
    }

    #[test]
    fn test_render_md_lists_failures() {
        let md = render_report_md(&sample());
        assert!(md.contains("- failed: 1"));
        assert!(md.contains("`b` (2 attempt(s))"));
        assert!(md.contains("after 2 attempts"));
    }

    #[test]
    fn test_write_report_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = sample().with_elapsed(Duration::from_millis(1500));
        write_report_json(&path, &report).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["elapsed_ms"], 1500);
        assert_eq!(value["failed"]["b"]["error"]["kind"], "network");
        assert_eq!(value["succeeded"], serde_json::json!(["a", "c"]));
    }
}

//! Job manifest: the list of commands a run executes.
//!
//! ```json
//! {
//!   "defaults": { "policy": "network", "timeout_secs": 600 },
//!   "jobs": [
//!     { "id": "fetch-1", "command": ["curl", "-fsSO", "https://example.org/a"] },
//!     { "id": "fetch-2", "label": "mirror b", "command": ["rsync", "b", "dst/"], "policy": "download" }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleetrun_core::{Job, JobError, RetryPreset};
use serde::{Deserialize, Serialize};

use crate::command::CommandExecutor;

/// Values applied to every job that does not set its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestDefaults {
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// One job entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl JobSpec {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub defaults: ManifestDefaults,
    pub jobs: Vec<JobSpec>,
}

impl Manifest {
    /// Read, parse and validate a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {:?}", path))?;
        let manifest = Self::from_json(&content)
            .with_context(|| format!("Invalid manifest {:?}", path))?;
        Ok(manifest)
    }

    /// Parse and validate manifest JSON.
    pub fn from_json(content: &str) -> Result<Self, JobError> {
        let manifest: Manifest = serde_json::from_str(content).map_err(|e| {
            JobError::wrap(
                fleetrun_core::ErrorKind::Validation,
                "manifest is not valid JSON",
                e,
            )
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.jobs.is_empty() {
            return Err(JobError::validation("manifest contains no jobs"));
        }
        if let Some(policy) = &self.defaults.policy {
            parse_policy(policy).map_err(|e| e.with_context("field", "defaults.policy"))?;
        }

        let mut seen = HashSet::new();
        for (index, spec) in self.jobs.iter().enumerate() {
            if spec.id.trim().is_empty() {
                return Err(JobError::validation("job id must not be empty")
                    .with_context("index", index));
            }
            if !seen.insert(spec.id.as_str()) {
                return Err(JobError::validation(format!("duplicate job id '{}'", spec.id)));
            }
            if spec.command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(JobError::validation(format!(
                    "job '{}' has an empty command",
                    spec.id
                )));
            }
            if let Some(policy) = &spec.policy {
                parse_policy(policy).map_err(|e| e.with_context("job", &spec.id))?;
            }
        }
        Ok(())
    }

    /// Build one dispatchable job per entry, with defaults applied.
    pub fn into_jobs(self) -> Vec<Job> {
        let defaults = self.defaults;
        self.jobs
            .into_iter()
            .map(|spec| {
                let timeout = spec
                    .timeout_secs
                    .or(defaults.timeout_secs)
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs);
                let cwd = spec.cwd.clone().or_else(|| defaults.cwd.clone());
                let policy = spec.policy.clone().or_else(|| defaults.policy.clone());

                let mut executor =
                    CommandExecutor::new(spec.command.clone()).with_env(spec.env.clone());
                if let Some(timeout) = timeout {
                    executor = executor.with_timeout(timeout);
                }
                if let Some(cwd) = cwd {
                    executor = executor.with_cwd(cwd);
                }

                let job = Job::new(spec.id.as_str(), spec.label(), Arc::new(executor));
                match policy {
                    Some(policy) => job.with_policy(policy),
                    None => job,
                }
            })
            .collect()
    }
}

/// Parse a policy name into a preset, as a validation error.
pub fn parse_policy(name: &str) -> Result<RetryPreset, JobError> {
    name.parse::<RetryPreset>().map_err(JobError::validation)
}

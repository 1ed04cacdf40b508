//! Persistent CLI settings (`~/.fleetrun/config.json`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fleetrun_core::{RetryPreset, DEFAULT_CONCURRENCY};
use serde::{Deserialize, Serialize};

use crate::display::ProgressStyle;

/// Upper bound on `--concurrency` accepted by the CLI.
pub const MAX_CONCURRENCY: usize = 10;

const SETTINGS_DIR: &str = ".fleetrun";
const SETTINGS_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_concurrent: usize,
    pub default_policy: RetryPreset,
    pub progress_style: ProgressStyle,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_CONCURRENCY,
            default_policy: RetryPreset::Default,
            progress_style: ProgressStyle::Bar,
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {:?}", path))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings {:?}", path))?;
        Ok(settings)
    }

    /// Write settings as pretty JSON, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

/// `$HOME/.fleetrun/config.json`, or `./.fleetrun/config.json` without a
/// home directory.
pub fn default_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(SETTINGS_DIR).join(SETTINGS_FILE)
}

/// Validate a concurrency value from flags or settings.
pub fn check_concurrency(concurrency: usize) -> Result<usize> {
    if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
        anyhow::bail!(
            "concurrency must be between 1 and {}, got {}",
            MAX_CONCURRENCY,
            concurrency
        );
    }
    Ok(concurrency)
}

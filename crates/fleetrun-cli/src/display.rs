//! Terminal rendering of progress snapshots and run reports.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use fleetrun_core::{ProgressObserver, ProgressSnapshot, Report};
use serde::{Deserialize, Serialize};

const BAR_WIDTH: usize = 30;

/// How progress is drawn on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStyle {
    /// Single line redrawn in place
    #[default]
    Bar,
    /// One line per update
    Lines,
    /// Redrawn line with rate and ETA
    Detailed,
    /// No progress output
    Quiet,
}

/// Text for one snapshot in the given style, `None` for `Quiet`.
pub fn render_progress(style: ProgressStyle, snapshot: &ProgressSnapshot) -> Option<String> {
    match style {
        ProgressStyle::Bar => Some(format!(
            "\r{} {:>5.1}% [{}/{}] {}",
            bar(snapshot.percentage(), BAR_WIDTH),
            snapshot.percentage(),
            snapshot.done(),
            snapshot.total,
            snapshot.current
        )),
        ProgressStyle::Lines => Some(format!(
            "[{}/{}] {}\n",
            snapshot.done(),
            snapshot.total,
            snapshot.current
        )),
        ProgressStyle::Detailed => {
            let eta = snapshot
                .eta()
                .map(format_duration)
                .unwrap_or_else(|| "?".to_string());
            Some(format!(
                "\r[{}/{}] {:.1}% | {} | {:.1}/sec | {} elapsed | ~{} remaining",
                snapshot.done(),
                snapshot.total,
                snapshot.percentage(),
                snapshot.current,
                snapshot.rate(),
                format_duration(snapshot.elapsed()),
                eta
            ))
        }
        ProgressStyle::Quiet => None,
    }
}

/// Observer printing snapshots to stdout, `None` for `Quiet`.
pub fn progress_observer(style: ProgressStyle) -> Option<Arc<dyn ProgressObserver>> {
    if style == ProgressStyle::Quiet {
        return None;
    }
    Some(Arc::new(move |snapshot: &ProgressSnapshot| {
        if let Some(text) = render_progress(style, snapshot) {
            let mut out = std::io::stdout().lock();
            // Progress output is best effort.
            let _ = out.write_all(text.as_bytes());
            if snapshot.is_finished() && style != ProgressStyle::Lines {
                let _ = out.write_all(b"\n");
            }
            let _ = out.flush();
        }
    }))
}

/// Human-readable end-of-run summary.
pub fn render_summary(report: &Report) -> String {
    let mut out = format!(
        "{} succeeded, {} failed ({} total) in {}\n",
        report.succeeded.len(),
        report.failed.len(),
        report.total(),
        format_duration(report.elapsed)
    );
    for (id, failed) in &report.failed {
        out.push_str(&format!(
            "  x {} ({} attempt(s)): {}\n",
            id,
            failed.attempts,
            failed.error.describe()
        ));
        out.push_str(&format!("    hint: {}\n", failed.error.user_hint()));
    }
    out
}

fn bar(percentage: f64, width: usize) -> String {
    let filled = ((percentage / 100.0) * width as f64).round() as usize;
    let filled = filled.min(width);
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

/// `42s`, `3m07s` or `1h02m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

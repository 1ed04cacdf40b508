//! fleetrun - run a batch of commands with bounded parallelism and retries
//!
//! ## Commands
//!
//! - `run`: execute every job of a manifest and print the report
//! - `validate`: check a manifest without running it
//! - `policies`: list the retry policy presets
//! - `config`: create or show the settings file

mod command;
mod display;
mod manifest;
mod settings;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetrun_core::{
    render_report_md, write_report_json, DispatchConfig, DispatchError, Dispatcher, Report,
    RetryPreset,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use crate::display::{progress_observer, render_summary, ProgressStyle};
use crate::manifest::Manifest;
use crate::settings::{check_concurrency, Settings};

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a batch of commands with bounded parallelism and retries", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (default: ~/.fleetrun/config.json)
    #[arg(long, global = true, env = "FLEETRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every job in a manifest
    Run(RunArgs),

    /// Load and validate a manifest without running it
    Validate {
        /// Path to the job manifest (JSON)
        manifest: PathBuf,
    },

    /// List the retry policy presets
    Policies,

    /// Manage the settings file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the job manifest (JSON)
    manifest: PathBuf,

    /// Maximum number of jobs running at once (1-10)
    #[arg(short = 'j', long, env = "FLEETRUN_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Retry policy for jobs that do not name one
    #[arg(long)]
    policy: Option<RetryPreset>,

    /// Progress display style
    #[arg(long, value_enum)]
    progress: Option<ProgressStyle>,

    /// Write the run report as JSON
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Write the run report as markdown
    #[arg(long)]
    report_md: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a settings file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective settings
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    fleetrun_core::init_tracing(cli.json, level);

    let settings_path = cli.config.unwrap_or_else(settings::default_path);

    match cli.command {
        Commands::Run(args) => {
            let settings = Settings::load(&settings_path)?;
            cmd_run(&settings, args).await
        }
        Commands::Validate { manifest } => cmd_validate(&manifest),
        Commands::Policies => cmd_policies(),
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(&settings_path, force),
            ConfigAction::Show => cmd_config_show(&settings_path),
        },
    }
}

async fn cmd_run(settings: &Settings, args: RunArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)?;
    let concurrency = check_concurrency(args.concurrency.unwrap_or(settings.max_concurrent))?;
    let default_policy = args.policy.unwrap_or(settings.default_policy);
    let style = args.progress.unwrap_or(settings.progress_style);

    let jobs = manifest.into_jobs();
    info!(
        jobs = jobs.len(),
        concurrency = concurrency,
        policy = %default_policy,
        "starting run"
    );

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling pending jobs");
                cancel.cancel();
            }
        })
    };

    let mut dispatcher = Dispatcher::new(DispatchConfig::with_concurrency(concurrency))
        .with_retry_policy(move |job| resolve_policy(job.policy(), default_policy).config())
        .with_cancellation(cancel);
    if let Some(observer) = progress_observer(style) {
        dispatcher = dispatcher.subscribe(observer);
    }

    let outcome = dispatcher.dispatch(jobs).await;
    interrupt.abort();

    let (report, cancelled) = match outcome {
        Ok(report) => (report, false),
        Err(DispatchError::Cancelled { report }) => (*report, true),
        Err(e) => return Err(e).context("Dispatch failed"),
    };

    print!("{}", render_summary(&report));
    write_reports(&report, args.report_json.as_deref(), args.report_md.as_deref())?;

    if cancelled {
        anyhow::bail!(
            "run cancelled: {} of {} jobs did not complete",
            report.cancelled_count(),
            report.total()
        );
    }
    if let Some(failure) = report.failure() {
        return Err(failure.into());
    }
    Ok(())
}

/// Preset named by a job, or `fallback` when it names none.
fn resolve_policy(name: Option<&str>, fallback: RetryPreset) -> RetryPreset {
    name.and_then(|n| n.parse().ok()).unwrap_or(fallback)
}

fn write_reports(report: &Report, json: Option<&Path>, md: Option<&Path>) -> Result<()> {
    if let Some(path) = json {
        write_report_json(path, report)?;
        info!(path = %path.display(), "wrote JSON report");
    }
    if let Some(path) = md {
        std::fs::write(path, render_report_md(report))
            .with_context(|| format!("Failed to write {:?}", path))?;
        info!(path = %path.display(), "wrote markdown report");
    }
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    let manifest = Manifest::load(path)?;
    println!("{}: {} job(s) OK", path.display(), manifest.jobs.len());
    Ok(())
}

fn cmd_policies() -> Result<()> {
    println!(
        "{:<10} {:>8} {:>10} {:>10} {:>10} {:>7}",
        "POLICY", "ATTEMPTS", "BASE", "MAX", "MULTIPLIER", "JITTER"
    );
    for preset in RetryPreset::ALL {
        let cfg = preset.config();
        println!(
            "{:<10} {:>8} {:>10} {:>10} {:>10.1} {:>7}",
            preset.name(),
            cfg.max_attempts,
            format!("{:?}", cfg.base_delay),
            format!("{:?}", cfg.max_delay),
            cfg.multiplier,
            if cfg.jitter { "yes" } else { "no" }
        );
    }
    Ok(())
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Settings::default().save(path)?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

fn cmd_config_show(path: &Path) -> Result<()> {
    let settings = Settings::load(path)?;
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

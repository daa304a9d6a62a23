//! CLI entry point for bibp.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use bibp_core::pipeline::ProgressCallback;
use bibp_core::{Citation, Pipeline, PipelineConfig, RunReport};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

mod cli;

use cli::Args;

/// Process outcome mapped to the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessExit {
    /// Nothing failed.
    Success,
    /// Some citations succeeded, some failed.
    Partial,
    /// No citation succeeded, or the run could not start.
    Failure,
}

impl From<ProcessExit> for ExitCode {
    fn from(exit: ProcessExit) -> Self {
        match exit {
            ProcessExit::Success => ExitCode::SUCCESS,
            ProcessExit::Partial => ExitCode::from(2),
            ProcessExit::Failure => ExitCode::FAILURE,
        }
    }
}

/// Maps success/failure counts to the process exit outcome.
fn determine_exit_outcome(succeeded: usize, failed: usize) -> ProcessExit {
    if failed == 0 {
        ProcessExit::Success
    } else if succeeded > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    match run(args).await {
        Ok(exit) => exit.into(),
        Err(error) => {
            eprintln!("Error: {error:#}");
            ProcessExit::Failure.into()
        }
    }
}

async fn run(args: Args) -> Result<ProcessExit> {
    let mut config = PipelineConfig::load(args.config.as_deref())?;
    apply_cli_overrides(&mut config, &args);
    init_tracing(&args, config.log_level.as_deref());
    debug!(?args, "CLI arguments parsed");

    let citations = read_citations(&args)?;
    if citations.is_empty() {
        info!("No citations in input");
        return Ok(ProcessExit::Success);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let pipeline = Pipeline::from_config(&config, &args.output_dir, interrupted)?;
    info!(
        citations = citations.len(),
        sources = ?pipeline.source_names(),
        "bibp starting"
    );

    let report = if should_show_progress(&args) {
        let bar = progress_bar(citations.len());
        let tick = bar.clone();
        let progress: ProgressCallback = Arc::new(move |result| {
            tick.set_message(result.citation_id.clone());
            tick.inc(1);
        });
        let report = pipeline.run_with_progress(citations, progress).await;
        bar.finish_and_clear();
        report
    } else {
        pipeline.run(citations).await
    };

    print_report(&report, args.json)?;
    Ok(determine_exit_outcome(report.succeeded, report.failed))
}

fn apply_cli_overrides(config: &mut PipelineConfig, args: &Args) {
    if let Some(max_threads) = args.max_threads {
        config.max_threads = usize::from(max_threads);
    }
    if let Some(max_retries) = args.max_retries {
        config.max_retries = u32::from(max_retries);
    }
    if args.skip_existing {
        config.skip_existing = true;
    }
    if let Some(email) = &args.email {
        config.contact_email = Some(email.clone());
    }
}

/// Priority: `RUST_LOG` > `--quiet` > `-v`/`-vv` > config `log_level` > `info`.
fn init_tracing(args: &Args, config_level: Option<&str>) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => config_level.unwrap_or("info"),
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn read_citations(args: &Args) -> Result<Vec<Citation>> {
    let raw = if let Some(path) = args.input_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("cannot read citations from {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("cannot read citations from stdin")?;
        buffer
    } else {
        bail!("no input: pass a citations JSON file or pipe one via stdin");
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).context("input must be a JSON array of citations")
}

fn should_show_progress(args: &Args) -> bool {
    io::stderr().is_terminal() && !args.quiet && !args.json
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for result in &report.results {
        println!("{}", result.summary_line());
    }
    println!();
    for line in report.summary_lines() {
        println!("{line}");
    }
    Ok(())
}

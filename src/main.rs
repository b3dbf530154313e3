use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use soundcheck::engine::{Config, Validator};
use soundcheck::models::{Outcome, ValidationEvent};

#[derive(Parser)]
#[command(
    name = "soundcheck",
    version,
    about = "Validates that audio files (FLAC, MP3, WavPack, Ogg-Vorbis) decode cleanly"
)]
struct Cli {
    /// Audio files or directories to validate (directories are scanned
    /// recursively)
    paths: Vec<PathBuf>,

    /// Number of decode workers (default: number of logical CPUs)
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Always stream from disk instead of buffering whole files in memory
    #[arg(long)]
    unbuffered: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Suppress per-file progress lines
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.paths.is_empty() {
        bail!("no input paths; pass audio files or directories to validate");
    }

    let (events, receiver) = mpsc::channel();
    let validator = Validator::new(
        &Config { jobs: cli.jobs, unbuffered: cli.unbuffered },
        events,
    )
    .context("failed to start decode workers")?;

    validator.submit(cli.paths.clone());

    let mut total = 0usize;
    let mut done = 0usize;
    let mut report = None;
    while let Ok(event) = receiver.recv() {
        match event {
            ValidationEvent::TotalChanged(n) => total = n,
            ValidationEvent::FileFinished(record) => {
                done += 1;
                if !cli.quiet {
                    match &record.outcome {
                        Outcome::Passed => {
                            eprintln!("[{done}/{total}]  {}", record.path);
                        }
                        Outcome::Failed { error } => {
                            eprintln!("[{done}/{total}]  {}  <{error}>", record.path);
                        }
                    }
                }
            }
            ValidationEvent::StatusTransient(message) if !cli.quiet => {
                eprintln!("{message}");
            }
            ValidationEvent::RunFinished(finished) => {
                report = Some(finished);
                break;
            }
            _ => {}
        }
    }
    let report = report.context("validation ended without a final report")?;
    validator.shutdown();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.to_text());
    }

    Ok(if report.failed.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

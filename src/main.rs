//! Taskmill CLI
//!
//! Entry point for the `taskmill` grader: one evaluation request on
//! standard input, one report on standard output. All diagnostics go to
//! standard error so the output stream stays machine-readable.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use taskmill::schema::{self, SchemaKind};
use taskmill::{evaluate, GraderConfig, GraderResult};

#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Contest task evaluation engine", version)]
struct Cli {
    /// Path to the TOML configuration file (built-in defaults otherwise)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Read the evaluation request from a file instead of standard input
    #[arg(long, short = 'i')]
    input: Option<PathBuf>,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskmill=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> GraderResult<()> {
    let config = GraderConfig::load(cli.config.as_deref())?;

    let raw_text = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            text
        }
    };
    schema::validate(&config, SchemaKind::Input, &raw_text)?;
    let raw: serde_json::Value = serde_json::from_str(&raw_text)?;

    let (report, outcome) = evaluate(&config, raw);

    // The partial report is emitted even when the evaluation failed
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    let validation = schema::validate(&config, SchemaKind::Output, &rendered);

    let mut stdout = io::stdout().lock();
    stdout.write_all(rendered.as_bytes())?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;

    match outcome {
        Some(err) => Err(err),
        None => validation,
    }
}

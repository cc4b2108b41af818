//! Command-line runner for cascade programs.
//!
//! Programs are JSON expression-record files produced by a front end; the
//! runner evaluates them and prints the export table as JSON.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cascade::{Engine, Program};

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Run cascade expression programs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate a program file and print its exports as JSON
    Run {
        /// Path to a JSON program file
        program: PathBuf,

        /// Advance the virtual clock by this many milliseconds after the
        /// program has run, firing scheduled re-evaluations
        #[arg(long, default_value = "0")]
        advance: u64,

        /// Pretty-print the export table
        #[arg(long)]
        pretty: bool,
    },
    /// Evaluate a program passed inline as a JSON string
    Eval {
        /// The program as JSON
        json: String,
    },
    /// Parse a program file and report whether it is well-formed
    Check {
        /// Path to a JSON program file
        program: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            program,
            advance,
            pretty,
        } => {
            let text = std::fs::read_to_string(&program)
                .with_context(|| format!("cannot read {}", program.display()))?;
            let program: Program = serde_json::from_str(&text)
                .with_context(|| "program file is not valid JSON expression records")?;
            run(&program, advance, pretty)
        }
        Command::Eval { json } => {
            let program: Program =
                serde_json::from_str(&json).with_context(|| "not valid JSON expression records")?;
            run(&program, 0, false)
        }
        Command::Check { program } => {
            let text = std::fs::read_to_string(&program)
                .with_context(|| format!("cannot read {}", program.display()))?;
            let parsed: Program = serde_json::from_str(&text)
                .with_context(|| "program file is not valid JSON expression records")?;
            println!("ok: {} top-level statements", parsed.statements.len());
            Ok(())
        }
    }
}

fn run(program: &Program, advance: u64, pretty: bool) -> anyhow::Result<()> {
    let mut engine = Engine::new();
    let outcome = engine.run_program(program);
    if advance > 0 {
        debug!(advance, "advancing virtual clock");
        engine
            .advance(advance)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
    }

    let exports: serde_json::Map<String, serde_json::Value> = outcome
        .exports
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_json()))
        .collect();
    let exports = serde_json::Value::Object(exports);
    if pretty {
        println!("{}", serde_json::to_string_pretty(&exports)?);
    } else {
        println!("{exports}");
    }

    if let Some(error) = outcome.error {
        bail!("{error}");
    }
    Ok(())
}

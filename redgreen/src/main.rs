//! Red-Green-Refactor cycle orchestrator CLI.
//!
//! Actions are JSON objects (`{"action": "write_test", ...}`). `call` runs
//! one action, `serve` reads one action per stdin line, and every response is
//! printed to stdout as one JSON line.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use redgreen::cycle::LiveOrchestrator;
use redgreen::exit_codes;
use redgreen::io::config::config_from_env;
use redgreen::logging;

#[derive(Parser)]
#[command(
    name = "redgreen",
    version,
    about = "Red-Green-Refactor cycle orchestrator"
)]
struct Cli {
    /// Project directory that test commands run in and file paths resolve against.
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one JSON action and print the response.
    Call {
        /// Request object, e.g. '{"action":"init","feature":"sum"}'.
        request: String,
    },
    /// Read newline-delimited JSON actions from stdin until EOF.
    Serve,
    /// Print the active cycle.
    Status,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = config_from_env()?;
    let mut orchestrator = LiveOrchestrator::live(config, cli.project_root)?;
    match cli.command {
        Command::Call { request } => cmd_call(&mut orchestrator, &request),
        Command::Serve => cmd_serve(&mut orchestrator),
        Command::Status => cmd_status(&orchestrator),
    }
}

fn cmd_call(orchestrator: &mut LiveOrchestrator, request: &str) -> Result<i32> {
    let response = orchestrator.handle_json(request);
    println!("{}", response.to_line());
    Ok(if response.success {
        exit_codes::OK
    } else {
        exit_codes::ACTION_FAILED
    })
}

/// A failed action produces a failure response; only stdin/stdout errors end the loop.
fn cmd_serve(orchestrator: &mut LiveOrchestrator) -> Result<i32> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut handled = 0usize;
    info!("serving actions from stdin");

    for line in stdin.lock().lines() {
        let line = line.context("read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = orchestrator.handle_json(&line);
        writeln!(stdout, "{}", response.to_line()).context("write response")?;
        stdout.flush().context("flush stdout")?;
        handled += 1;
    }

    debug!(handled, "stdin closed");
    Ok(exit_codes::OK)
}

fn cmd_status(orchestrator: &LiveOrchestrator) -> Result<i32> {
    let outcome = orchestrator.status()?;
    println!("{}", outcome.message);
    if outcome.data["active"].is_null() {
        return Ok(exit_codes::NO_CYCLE);
    }
    let pretty = serde_json::to_string_pretty(&outcome.data).context("serialize status")?;
    println!("{pretty}");
    Ok(exit_codes::OK)
}

//! CLI surface: parse a verb, make sure the daemon is up, forward the
//! command over the local socket and render the reply.

pub mod format;

use crate::daemon::{self, SessionPaths};
use crate::proto::{Command, StepKind};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(
    name = "adbg",
    about = "Language-agnostic debugger CLI speaking DAP to per-language backends",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand, Debug)]
enum Verb {
    /// Launch a program under a debugger
    Start {
        /// Script or binary to debug
        script: String,
        /// Breakpoints as file:line[:condition], repeatable
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<String>,
        /// Adapter language (python, node, go, native); inferred from the
        /// script extension when omitted
        #[arg(long)]
        language: Option<String>,
        /// Runtime/toolchain binary for the adapter
        #[arg(long, visible_alias = "python")]
        runtime: Option<String>,
        /// Working directory for the debuggee
        #[arg(long)]
        cwd: Option<String>,
        /// Pause on the first line before running
        #[arg(long)]
        stop_on_entry: bool,
        /// Remaining arguments are forwarded to the debuggee
        #[arg(long, num_args = 0.., allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Attach to an already-running debuggee
    Attach {
        /// Host of a listening DAP server (with --port)
        #[arg(long)]
        host: Option<String>,
        /// Port of a listening DAP server
        #[arg(long)]
        port: Option<u16>,
        /// Pid to inject a DAP server into
        #[arg(long)]
        pid: Option<i32>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long, visible_alias = "python")]
        runtime: Option<String>,
        #[arg(short = 'b', long = "break")]
        breakpoints: Vec<String>,
    },
    /// Show local variables of the current frame
    Vars,
    /// Show the call stack
    Stack,
    /// Evaluate an expression in the current frame
    Eval {
        expression: String,
    },
    /// Step over, into or out (default: over)
    Step {
        kind: Option<String>,
    },
    /// Resume execution until the next stop
    Continue,
    /// Set a breakpoint: file:line[:condition]
    Break {
        location: String,
    },
    /// Show source around a line
    Source {
        file: Option<String>,
        line: Option<i64>,
    },
    /// Report session state
    Status,
    /// End the session and stop the daemon
    Close,
    /// Run the session daemon in the foreground (started automatically)
    #[command(hide = true)]
    Daemon,
}

pub fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    crate::log::init();

    let paths = SessionPaths::resolve()?;
    if matches!(cli.verb, Verb::Daemon) {
        daemon::run(&paths)?;
        return Ok(0);
    }

    let command = to_command(cli.verb)?;
    daemon::ensure_running(&paths)?;
    let reply = daemon::call(&paths, &command)?;
    Ok(format::render(&reply))
}

fn to_command(verb: Verb) -> anyhow::Result<Command> {
    Ok(match verb {
        Verb::Start {
            script,
            breakpoints,
            language,
            runtime,
            cwd,
            stop_on_entry,
            args,
        } => Command::Start {
            script: absolutize(script),
            language,
            breakpoints: breakpoints.into_iter().map(absolutize_breakpoint).collect(),
            runtime,
            args,
            cwd: cwd.map(absolutize),
            stop_on_entry,
        },
        Verb::Attach {
            host,
            port,
            pid,
            language,
            runtime,
            breakpoints,
        } => Command::Attach {
            host,
            port,
            pid,
            language,
            runtime,
            breakpoints: breakpoints.into_iter().map(absolutize_breakpoint).collect(),
        },
        Verb::Vars => Command::Vars,
        Verb::Stack => Command::Stack,
        Verb::Eval { expression } => Command::Eval { expression },
        Verb::Step { kind } => Command::Step {
            kind: kind
                .map(|k| StepKind::from_str(&k).map_err(|e| anyhow::anyhow!(e)))
                .transpose()?,
        },
        Verb::Continue => Command::Continue,
        Verb::Break { location } => {
            let spec = crate::adapters::BreakpointSpec::parse(&location)
                .with_context(|| format!("invalid breakpoint `{location}`, expected file:line[:condition]"))?;
            Command::Break {
                file: absolutize(spec.file.display().to_string()),
                line: spec.line,
                condition: spec.condition,
            }
        }
        Verb::Source { file, line } => Command::Source {
            file: file.map(absolutize),
            line,
        },
        Verb::Status => Command::Status,
        Verb::Close => Command::Close,
        Verb::Daemon => unreachable!("handled before dispatch"),
    })
}

/// The daemon's working directory is wherever it was first spawned, so
/// relative paths must be resolved against the invoking shell's cwd here.
fn absolutize(path: String) -> String {
    std::path::absolute(&path)
        .map(|p| p.display().to_string())
        .unwrap_or(path)
}

fn absolutize_breakpoint(raw: String) -> String {
    match crate::adapters::BreakpointSpec::parse(&raw) {
        Some(spec) => {
            let file = absolutize(spec.file.display().to_string());
            match spec.condition {
                Some(condition) => format!("{file}:{}:{condition}", spec.line),
                None => format!("{file}:{}", spec.line),
            }
        }
        // leave malformed specs alone, the daemon logs the skip
        None => raw,
    }
}

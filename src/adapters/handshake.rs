//! The classic DAP handshake, shared by every adapter.
//!
//! All four launch-capable adapters perform the same sequence; they differ
//! only in the request bodies their strategy supplies. debugpy additionally
//! defers the `launch`/`attach` response until `configurationDone`, which is
//! why step 2 goes through `request_async` and is only resolved at step 7.

use crate::adapters::{AdapterStrategy, AttachTarget, BreakpointSpec, LaunchOptions};
use crate::dap::DapClient;
use crate::dap::client::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use serde_json::{Value, json};
use std::path::Path;
use std::time::{Duration, Instant};

const INITIALIZED_TIMEOUT: Duration = Duration::from_secs(10);
const START_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_TICK: Duration = Duration::from_secs(1);

/// How a handshake (or a continue/step) left the debuggee.
#[derive(Debug, Clone)]
pub enum StopOutcome {
    Paused { thread_id: i64, reason: String },
    Terminated { exit_code: Option<i64> },
    Running,
}

/// Breakpoint placement as acknowledged by the adapter.
#[derive(Debug, Clone)]
pub struct VerifiedBreakpoint {
    pub file: String,
    pub line: i64,
    pub verified: bool,
}

pub struct Handshake {
    pub outcome: StopOutcome,
    pub breakpoints: Vec<VerifiedBreakpoint>,
}

/// Launch-mode handshake: initialize, deferred launch, breakpoints,
/// configurationDone, resolve launch, then observe the first stop.
pub fn init_flow(
    client: &mut DapClient,
    adapter: &dyn AdapterStrategy,
    opts: &LaunchOptions,
    breakpoints: &[BreakpointSpec],
) -> Result<Handshake> {
    client.request("initialize", adapter.initialize_args(), DEFAULT_REQUEST_TIMEOUT)?;
    let start_seq = client.request_async("launch", adapter.launch_args(opts))?;
    let verified = configure(client, breakpoints)?;
    client
        .wait_for_response(start_seq, START_TIMEOUT)
        .map_err(|e| match e {
            Error::Adapter(msg) => Error::Handshake(msg),
            other => other,
        })?;

    // The first stop may already be queued: the adapter is free to emit
    // `stopped` (or `terminated`) before the deferred launch resolves.
    let outcome = wait_stop_outcome(client, Some(Instant::now() + START_TIMEOUT))?;
    Ok(Handshake {
        outcome,
        breakpoints: verified,
    })
}

/// Attach-mode handshake. Identical wire traffic with `attach` in place of
/// `launch`, but the debuggee was already executing, so completion leaves it
/// running and reports no location.
pub fn attach_flow(
    client: &mut DapClient,
    adapter: &dyn AdapterStrategy,
    target: &AttachTarget,
    breakpoints: &[BreakpointSpec],
) -> Result<Handshake> {
    client.request("initialize", adapter.initialize_args(), DEFAULT_REQUEST_TIMEOUT)?;
    let start_seq = client.request_async("attach", adapter.attach_args(target))?;
    let verified = configure(client, breakpoints)?;
    client
        .wait_for_response(start_seq, START_TIMEOUT)
        .map_err(|e| match e {
            Error::Adapter(msg) => Error::Handshake(msg),
            other => other,
        })?;

    Ok(Handshake {
        outcome: StopOutcome::Running,
        breakpoints: verified,
    })
}

/// Steps 3..6: wait for `initialized`, send the full breakpoint set per
/// file, disable exception breaks, signal `configurationDone`.
fn configure(
    client: &mut DapClient,
    breakpoints: &[BreakpointSpec],
) -> Result<Vec<VerifiedBreakpoint>> {
    let initialized = client.wait_for_event("initialized", INITIALIZED_TIMEOUT)?;
    if initialized.is_none() {
        return Err(Error::Handshake(
            "adapter never sent `initialized`".to_string(),
        ));
    }

    let mut verified = Vec::new();
    for (file, group) in BreakpointSpec::group_by_file(breakpoints) {
        verified.extend(set_breakpoints(client, &file, &group)?);
    }

    client.request(
        "setExceptionBreakpoints",
        json!({ "filters": [] }),
        DEFAULT_REQUEST_TIMEOUT,
    )?;
    client.request("configurationDone", Value::Null, DEFAULT_REQUEST_TIMEOUT)?;
    Ok(verified)
}

/// Send one `setBreakpoints` carrying the full set for `file`. DAP replaces
/// the file's breakpoints with exactly this list.
pub fn set_breakpoints(
    client: &mut DapClient,
    file: &Path,
    specs: &[&BreakpointSpec],
) -> Result<Vec<VerifiedBreakpoint>> {
    let breakpoints: Vec<Value> = specs
        .iter()
        .map(|spec| match &spec.condition {
            Some(cond) => json!({ "line": spec.line, "condition": cond }),
            None => json!({ "line": spec.line }),
        })
        .collect();
    let response = client.request(
        "setBreakpoints",
        json!({
            "source": { "path": file },
            "breakpoints": breakpoints,
        }),
        DEFAULT_REQUEST_TIMEOUT,
    )?;

    let reported = response.body.get("breakpoints").and_then(Value::as_array);
    Ok(specs
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            let entry = reported.and_then(|r| r.get(idx));
            VerifiedBreakpoint {
                file: file.display().to_string(),
                line: entry
                    .and_then(|e| e.get("line"))
                    .and_then(Value::as_i64)
                    .unwrap_or(spec.line),
                verified: entry
                    .and_then(|e| e.get("verified"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }
        })
        .collect())
}

/// Wait for the debuggee to stop or terminate. Ticks once per second:
/// `stopped` wins, a queued `terminated`/`exited` reports termination with
/// the exit code when one was provided, `output` events are drained
/// silently. With no deadline the loop is unbounded (the CLI bounds it).
pub fn wait_stop_outcome(client: &mut DapClient, deadline: Option<Instant>) -> Result<StopOutcome> {
    loop {
        let stopped = match client.wait_for_event("stopped", STOP_TICK) {
            Ok(ev) => ev,
            // the adapter went away underneath us: that is a termination
            Err(Error::ConnectionClosed) => return Ok(StopOutcome::Terminated { exit_code: None }),
            Err(err) => return Err(err),
        };
        if let Some(event) = stopped {
            // some adapters omit threadId here; 1 is correct for all of ours
            let thread_id = event
                .body
                .get("threadId")
                .and_then(Value::as_i64)
                .unwrap_or(1);
            let reason = event
                .body
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            return Ok(StopOutcome::Paused { thread_id, reason });
        }

        let exited = client.drain_events("exited")?;
        let terminated = client.drain_events("terminated")?;
        client.drain_events("output")?;
        if !terminated.is_empty() || !exited.is_empty() {
            let exit_code = exited
                .iter()
                .find_map(|ev| ev.body.get("exitCode").and_then(Value::as_i64));
            return Ok(StopOutcome::Terminated { exit_code });
        }

        if let Some(deadline) = deadline
            && Instant::now() > deadline
        {
            return Ok(StopOutcome::Running);
        }
    }
}

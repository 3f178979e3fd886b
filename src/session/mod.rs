//! The process-wide debug session: a state machine mapping the uniform verb
//! surface onto DAP traffic through the active adapter strategy.
//!
//! Exactly one session exists per daemon. Verbs run strictly one at a time,
//! so the session owns the DAP client without locking.

use crate::adapters::handshake::{self, StopOutcome, VerifiedBreakpoint};
use crate::adapters::{
    self, AdapterStrategy, AttachTarget, BreakpointSpec, LaunchOptions, SpawnedAdapter,
};
use crate::dap::DapClient;
use crate::dap::client::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::proto::{BreakpointInfo, Command, FrameInfo, Location, Reply, StepKind, VariableInfo};
use dap::types::{Scope, StackFrame, Variable};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);
const STACK_LEVELS: i64 = 50;
const MAX_VARIABLES: i64 = 100;
const SOURCE_CONTEXT: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Terminated => "terminated",
        }
    }
}

#[derive(Default)]
pub struct Session {
    state: SessionState,
    client: Option<DapClient>,
    adapter: Option<Box<dyn AdapterStrategy>>,
    adapter_child: Option<Child>,
    thread_id: Option<i64>,
    frame_id: Option<i64>,
    script: Option<PathBuf>,
    /// Entered via `attach`: `close` must leave the debuggee running.
    attached_mode: bool,
}

impl Session {
    pub fn new() -> Session {
        Session::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Dispatch one verb; every outcome becomes a reply, errors included.
    pub fn dispatch(&mut self, command: Command) -> Reply {
        let result = match command {
            Command::Start {
                script,
                language,
                breakpoints,
                runtime,
                args,
                cwd,
                stop_on_entry,
            } => self.start(script, language, breakpoints, runtime, args, cwd, stop_on_entry),
            Command::Attach {
                host,
                port,
                pid,
                language,
                runtime,
                breakpoints,
            } => self.attach(host, port, pid, language, runtime, breakpoints),
            Command::Vars => self.vars(),
            Command::Stack => self.stack(),
            Command::Eval { expression } => self.eval(&expression),
            Command::Step { kind } => self.step(kind.unwrap_or(StepKind::Over)),
            Command::Continue => self.cont(),
            Command::Break {
                file,
                line,
                condition,
            } => self.break_at(&file, line, condition),
            Command::Source { file, line } => self.source(file, line),
            Command::Status => self.status(),
            Command::Close => Ok(self.close()),
        };
        result.unwrap_or_else(|err| Reply::error(err.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        script: String,
        language: Option<String>,
        breakpoints: Vec<String>,
        runtime: Option<String>,
        args: Vec<String>,
        cwd: Option<String>,
        stop_on_entry: bool,
    ) -> Result<Reply> {
        if self.state() != SessionState::Idle {
            return Err(Error::AlreadyActive);
        }
        let script = std::fs::canonicalize(&script)
            .map_err(|_| Error::ScriptNotFound(PathBuf::from(&script)))?;
        let adapter = adapters::strategy_for(language.as_deref(), &script)?;
        adapter.check_installed(runtime.as_deref())?;

        let specs = parse_breakpoints(&breakpoints);
        let opts = LaunchOptions {
            program: script.clone(),
            args,
            cwd: cwd.map(PathBuf::from),
            stop_on_entry,
            runtime,
        };

        log::info!(target: "session", "starting {} via {}", script.display(), adapter.language());
        self.set_state(SessionState::Starting);
        self.script = Some(script);
        match self.launch(adapter, &opts, &specs) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.cleanup();
                Err(err)
            }
        }
    }

    fn launch(
        &mut self,
        adapter: Box<dyn AdapterStrategy>,
        opts: &LaunchOptions,
        specs: &[BreakpointSpec],
    ) -> Result<Reply> {
        let SpawnedAdapter { child, port } = adapter.spawn_adapter(opts)?;
        self.adapter_child = child;
        let mut client = DapClient::connect("127.0.0.1", port, CONNECT_TIMEOUT)?;
        let handshake = handshake::init_flow(&mut client, adapter.as_ref(), opts, specs)?;
        self.client = Some(client);
        self.adapter = Some(adapter);

        let mut reply = self.apply_outcome(handshake.outcome)?;
        reply.breakpoints = Some(to_breakpoint_info(handshake.breakpoints));
        Ok(reply)
    }

    fn attach(
        &mut self,
        host: Option<String>,
        port: Option<u16>,
        pid: Option<i32>,
        language: Option<String>,
        runtime: Option<String>,
        breakpoints: Vec<String>,
    ) -> Result<Reply> {
        if self.state() != SessionState::Idle {
            return Err(Error::AlreadyActive);
        }
        // attach has no script to sniff, python is the default
        let adapter = adapters::strategy_by_name(language.as_deref().unwrap_or("python"))?;
        let specs = parse_breakpoints(&breakpoints);

        let (target, host, port) = match (port, pid) {
            (Some(port), None) => {
                let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
                (AttachTarget::Tcp { host: host.clone(), port }, host, port)
            }
            (None, Some(pid)) => {
                let spawned = adapter.inject(pid, runtime.as_deref())?;
                self.adapter_child = spawned.child;
                (AttachTarget::Pid(pid), "127.0.0.1".to_string(), spawned.port)
            }
            _ => return Err(Error::AttachTarget),
        };

        log::info!(target: "session", "attaching to {host}:{port} via {}", adapter.language());
        self.set_state(SessionState::Starting);
        match self.attach_inner(adapter, &target, &host, port, &specs) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                self.cleanup();
                Err(err)
            }
        }
    }

    fn attach_inner(
        &mut self,
        adapter: Box<dyn AdapterStrategy>,
        target: &AttachTarget,
        host: &str,
        port: u16,
        specs: &[BreakpointSpec],
    ) -> Result<Reply> {
        let mut client = DapClient::connect(host, port, CONNECT_TIMEOUT)?;
        let handshake = handshake::attach_flow(&mut client, adapter.as_ref(), target, specs)?;
        self.client = Some(client);
        self.adapter = Some(adapter);
        self.attached_mode = true;
        self.set_state(SessionState::Running);

        let mut reply = Reply::state("running");
        reply.breakpoints = Some(to_breakpoint_info(handshake.breakpoints));
        Ok(reply)
    }

    fn vars(&mut self) -> Result<Reply> {
        self.require_paused("vars")?;
        let frame = self.refresh_top_frame()?;

        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        let response = client.request(
            "scopes",
            json!({ "frameId": frame.id }),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        let scopes: Vec<Scope> = decode_list(&response.body, "scopes")?;
        let Some(scope) = scopes
            .iter()
            .find(|s| s.name == "Locals" || s.name == "Local")
            .or_else(|| scopes.first())
        else {
            let mut reply = Reply::default();
            reply.variables = Some(Vec::new());
            return Ok(reply);
        };

        let response = client.request(
            "variables",
            json!({
                "variablesReference": scope.variables_reference,
                "count": MAX_VARIABLES,
            }),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        let variables: Vec<Variable> = decode_list(&response.body, "variables")?;
        let adapter = self.adapter.as_deref();
        let variables = variables
            .into_iter()
            .filter(|var| adapter.is_none_or(|a| !a.is_internal_variable(var)))
            .map(|var| VariableInfo {
                name: var.name,
                value: var.value,
                r#type: var.type_field,
            })
            .collect();

        let mut reply = Reply::default();
        reply.variables = Some(variables);
        Ok(reply)
    }

    fn stack(&mut self) -> Result<Reply> {
        self.require_paused("stack")?;
        let frames = self.fetch_frames(STACK_LEVELS)?;
        let adapter = self.adapter.as_deref();
        let frames = visible_frames(frames, adapter)
            .into_iter()
            .map(|frame| FrameInfo {
                name: frame.name,
                file: frame.source.and_then(|s| s.path),
                line: Some(frame.line),
            })
            .collect();

        let mut reply = Reply::default();
        reply.frames = Some(frames);
        Ok(reply)
    }

    fn eval(&mut self, expression: &str) -> Result<Reply> {
        self.require_paused("eval")?;
        let frame_id = match self.frame_id {
            Some(id) => id,
            None => self.refresh_top_frame()?.id,
        };
        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        // the expression is forwarded verbatim
        match client.request(
            "evaluate",
            json!({
                "expression": expression,
                "context": "repl",
                "frameId": frame_id,
            }),
            DEFAULT_REQUEST_TIMEOUT,
        ) {
            Ok(response) => {
                let mut reply = Reply::default();
                reply.result = response
                    .body
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                reply.r#type = response
                    .body
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(reply)
            }
            Err(Error::Adapter(message)) => Ok(Reply::error(message)),
            Err(err) => Err(err),
        }
    }

    fn step(&mut self, kind: StepKind) -> Result<Reply> {
        self.require_paused("step")?;
        let thread_id = self.thread_id.unwrap_or(1);
        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        client.request(
            kind.dap_command(),
            json!({ "threadId": thread_id }),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        self.set_state(SessionState::Running);
        self.frame_id = None;
        self.wait_for_stop()
    }

    fn cont(&mut self) -> Result<Reply> {
        match self.state() {
            SessionState::Paused => {
                let thread_id = self.thread_id.unwrap_or(1);
                let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
                client.request(
                    "continue",
                    json!({ "threadId": thread_id }),
                    DEFAULT_REQUEST_TIMEOUT,
                )?;
                self.set_state(SessionState::Running);
                self.frame_id = None;
                self.wait_for_stop()
            }
            // typical right after attach: the debuggee already runs
            SessionState::Running => self.wait_for_stop(),
            other => Err(Error::WrongState {
                verb: "continue",
                required: "paused or running",
                actual: other.as_str(),
            }),
        }
    }

    fn break_at(&mut self, file: &str, line: i64, condition: Option<String>) -> Result<Reply> {
        if self.state() == SessionState::Idle {
            return Err(Error::WrongState {
                verb: "break",
                required: "non-idle",
                actual: "idle",
            });
        }
        if line < 1 {
            return Ok(Reply::error(format!("invalid breakpoint line {line}")));
        }
        let file = absolute_path(file)?;
        let spec = BreakpointSpec {
            file,
            line,
            condition,
        };
        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        // replaces the file's whole breakpoint set with this one line
        let verified = handshake::set_breakpoints(client, &spec.file, &[&spec])?;

        let mut reply = Reply::default();
        reply.breakpoints = Some(to_breakpoint_info(verified));
        Ok(reply)
    }

    fn source(&mut self, file: Option<String>, line: Option<i64>) -> Result<Reply> {
        let (path, center) = match file {
            Some(file) => {
                let path = absolute_path(&file)?;
                let center = match line {
                    Some(line) => line,
                    None => self.current_line_in(&path)?,
                };
                (path, center)
            }
            None => match self.state() {
                SessionState::Paused => {
                    let location = self.paused_location("source")?;
                    (PathBuf::from(&location.file), line.unwrap_or(location.line))
                }
                // not paused: fall back to the session's script
                _ => match self.script.clone() {
                    Some(script) => (script, line.unwrap_or(SOURCE_CONTEXT + 1)),
                    None => {
                        return Err(Error::WrongState {
                            verb: "source",
                            required: "paused",
                            actual: self.state().as_str(),
                        });
                    }
                },
            },
        };

        let mut reply = Reply::default();
        reply.source = Some(render_source(&path, center)?);
        Ok(reply)
    }

    fn current_line_in(&mut self, path: &Path) -> Result<i64> {
        if self.state() == SessionState::Paused {
            let location = self.paused_location("source")?;
            if Path::new(&location.file) == path {
                return Ok(location.line);
            }
        }
        // nothing better to anchor on: show the top of the file
        Ok(SOURCE_CONTEXT + 1)
    }

    fn status(&mut self) -> Result<Reply> {
        let mut reply = Reply::state(self.state().as_str());
        if self.state() == SessionState::Paused {
            // locations are recomputed, never cached across events
            if let Ok(frame) = self.refresh_top_frame() {
                reply.location = Some(location_of(&frame));
            }
        }
        Ok(reply)
    }

    /// Tear the session down: disconnect (terminating the debuggee unless it
    /// was attached), reap the adapter child, reset to idle.
    pub fn close(&mut self) -> Reply {
        self.cleanup();
        let mut reply = Reply::state("idle");
        reply.message = Some("session closed".to_string());
        reply
    }

    fn cleanup(&mut self) {
        let attached = self.attached_mode;
        if let Some(mut client) = self.client.take() {
            client.disconnect(!attached);
        }
        if let Some(mut child) = self.adapter_child.take() {
            terminate_child(&mut child);
        }
        self.adapter = None;
        self.thread_id = None;
        self.frame_id = None;
        self.script = None;
        self.attached_mode = false;
        self.set_state(SessionState::Idle);
        log::info!(target: "session", "session closed");
    }

    /// Suspend until the debuggee pauses or terminates. No deadline here,
    /// the CLI layer owns any wall-clock bound.
    fn wait_for_stop(&mut self) -> Result<Reply> {
        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        let outcome = handshake::wait_stop_outcome(client, None)?;
        self.apply_outcome(outcome)
    }

    fn apply_outcome(&mut self, outcome: StopOutcome) -> Result<Reply> {
        match outcome {
            StopOutcome::Paused { thread_id, reason } => {
                self.thread_id = Some(thread_id);
                self.set_state(SessionState::Paused);
                let frame = self.refresh_top_frame()?;
                let mut reply = Reply::state("paused");
                reply.reason = Some(reason);
                reply.location = Some(location_of(&frame));
                Ok(reply)
            }
            StopOutcome::Terminated { exit_code } => {
                self.thread_id = None;
                self.frame_id = None;
                self.set_state(SessionState::Terminated);
                let mut reply = Reply::state("terminated");
                reply.exit_code = exit_code;
                Ok(reply)
            }
            StopOutcome::Running => {
                self.set_state(SessionState::Running);
                Ok(Reply::state("running"))
            }
        }
    }

    fn require_paused(&self, verb: &'static str) -> Result<()> {
        if self.state() != SessionState::Paused {
            return Err(Error::WrongState {
                verb,
                required: "paused",
                actual: self.state().as_str(),
            });
        }
        Ok(())
    }

    fn paused_location(&mut self, verb: &'static str) -> Result<Location> {
        self.require_paused(verb)?;
        let frame = self.refresh_top_frame()?;
        Ok(location_of(&frame))
    }

    /// First visible frame of the focused thread; records its id for `eval`.
    fn refresh_top_frame(&mut self) -> Result<StackFrame> {
        let frames = self.fetch_frames(STACK_LEVELS)?;
        let adapter = self.adapter.as_deref();
        let frame = visible_frames(frames, adapter)
            .into_iter()
            .next()
            .ok_or_else(|| Error::Adapter("adapter reported no stack frames".to_string()))?;
        self.frame_id = Some(frame.id);
        Ok(frame)
    }

    fn fetch_frames(&mut self, levels: i64) -> Result<Vec<StackFrame>> {
        let thread_id = self.thread_id.unwrap_or(1);
        let client = self.client.as_mut().ok_or(Error::ConnectionClosed)?;
        let response = client.request(
            "stackTrace",
            json!({ "threadId": thread_id, "startFrame": 0, "levels": levels }),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        decode_list(&response.body, "stackFrames")
    }
}

/// Internal-frame filtering must never leave a pause with nothing to show:
/// if everything is filtered, fall back to the raw top frame.
fn visible_frames(
    frames: Vec<StackFrame>,
    adapter: Option<&dyn AdapterStrategy>,
) -> Vec<StackFrame> {
    let filtered: Vec<StackFrame> = frames
        .iter()
        .filter(|frame| adapter.is_none_or(|a| !a.is_internal_frame(frame)))
        .cloned()
        .collect();
    if filtered.is_empty() {
        frames.into_iter().take(1).collect()
    } else {
        filtered
    }
}

fn location_of(frame: &StackFrame) -> Location {
    Location {
        file: frame
            .source
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| "<unknown>".to_string()),
        line: frame.line,
        function: frame.name.clone(),
    }
}

fn decode_list<T: serde::de::DeserializeOwned>(body: &Value, key: &str) -> Result<Vec<T>> {
    match body.get(key) {
        Some(list) => Ok(serde_json::from_value(list.clone())?),
        None => Ok(Vec::new()),
    }
}

fn to_breakpoint_info(verified: Vec<VerifiedBreakpoint>) -> Vec<BreakpointInfo> {
    verified
        .into_iter()
        .map(|bp| BreakpointInfo {
            file: bp.file,
            line: bp.line,
            verified: bp.verified,
        })
        .collect()
}

/// Parse CLI breakpoint strings, skipping (and logging) malformed entries.
fn parse_breakpoints(specs: &[String]) -> Vec<BreakpointSpec> {
    specs
        .iter()
        .filter_map(|raw| match BreakpointSpec::parse(raw) {
            Some(mut spec) => {
                if let Ok(file) = absolute_path(&spec.file.to_string_lossy()) {
                    spec.file = file;
                }
                Some(spec)
            }
            None => {
                log::warn!(target: "session", "skipping malformed breakpoint `{raw}`");
                None
            }
        })
        .collect()
}

fn absolute_path(file: &str) -> Result<PathBuf> {
    if let Ok(path) = std::fs::canonicalize(file) {
        return Ok(path);
    }
    Ok(std::path::absolute(file)?)
}

/// ±5 lines around `center`, numbered, with a `→` marker on the center line.
fn render_source(path: &Path, center: i64) -> Result<String> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.split('\n').collect();
    let first = (center - SOURCE_CONTEXT).max(1);
    let last = (center + SOURCE_CONTEXT).min(lines.len() as i64);

    let mut out = Vec::new();
    for number in first..=last {
        let text = lines[(number - 1) as usize];
        let marker = if number == center { "→" } else { " " };
        out.push(format!("{number:>4} {marker} {text}"));
    }
    Ok(out.join("\n"))
}

fn terminate_child(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = signal::kill(pid, Signal::SIGTERM);
    if crate::adapters::inject::wait_for_exit(child, CHILD_EXIT_GRACE).is_none() {
        log::warn!(target: "session", "adapter child ignored SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

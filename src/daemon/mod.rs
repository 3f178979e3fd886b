//! The session daemon and its client side.
//!
//! The daemon owns the single [`Session`] and serves the CLI over a
//! Unix-domain socket, one newline-delimited JSON command/reply pair per
//! connection, strictly sequentially. The CLI spawns it detached on demand
//! and reaps stale artifacts left by a dead daemon.

use crate::proto::{Command, Reply};
use crate::session::Session;
use crate::weak_error;
use anyhow::{Context, bail};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const SOCKET_READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_TICK: Duration = Duration::from_millis(100);
const SPAWN_POLL_DELAY: Duration = Duration::from_millis(100);
const SPAWN_POLL_ATTEMPTS: u32 = 30;
const CLEANUP_ESCAPE: Duration = Duration::from_secs(5);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Filesystem artifacts of a running daemon.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    /// `$AGENT_DEBUGGER_DIR` when set (tests), `$HOME/.agent-debugger`
    /// otherwise.
    pub fn resolve() -> anyhow::Result<SessionPaths> {
        if let Ok(dir) = std::env::var("AGENT_DEBUGGER_DIR") {
            return Ok(SessionPaths::at(PathBuf::from(dir)));
        }
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(SessionPaths::at(PathBuf::from(home).join(".agent-debugger")))
    }

    pub fn at(dir: PathBuf) -> SessionPaths {
        SessionPaths { dir }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("daemon.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join("daemon.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("daemon.log")
    }
}

extern "C" fn handle_signal(_: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    // the handler only sets the flag; the accept loop polls it on a tick
    // (std retries `accept` on EINTR, so an interrupted accept never
    // surfaces here)
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("install SIGTERM handler")?;
        sigaction(Signal::SIGINT, &action).context("install SIGINT handler")?;
    }
    Ok(())
}

/// Daemon entry point: bind the socket, serve commands until `close` or a
/// signal, then tear everything down.
pub fn run(paths: &SessionPaths) -> anyhow::Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create session directory {}", paths.dir.display()))?;
    let socket = paths.socket_path();
    if socket.exists() {
        log::info!(target: "daemon", "removing stale socket {}", socket.display());
        weak_error!(fs::remove_file(&socket));
    }
    fs::write(paths.pid_path(), format!("{}\n", std::process::id()))
        .context("write daemon pid file")?;

    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("bind {}", socket.display()))?;
    // std retries `accept` on EINTR, so a blocking accept would swallow the
    // shutdown flag; poll it on a tick instead
    listener
        .set_nonblocking(true)
        .context("set listener non-blocking")?;
    install_signal_handlers()?;

    log::info!(target: "daemon", "listening on {}", socket.display());
    let mut session = Session::new();

    loop {
        if SHUTDOWN.load(Ordering::SeqCst) {
            break;
        }
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_TICK);
                continue;
            }
            Err(err) => {
                log::warn!(target: "daemon", "accept failed: {err}");
                continue;
            }
        };
        // a panic mid-verb must still tear the session down, or the spawned
        // adapter (and its debuggee) outlive the daemon
        let served = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            serve_connection(&mut session, stream)
        }));
        match served {
            Ok(Ok(close_requested)) => {
                if close_requested {
                    log::info!(target: "daemon", "close requested, shutting down");
                    break;
                }
            }
            Ok(Err(err)) => log::warn!(target: "daemon", "connection failed: {err:#}"),
            Err(_) => {
                log::error!(target: "daemon", "panic while serving a command, shutting down");
                shutdown(paths, &mut session);
                std::process::exit(1);
            }
        }
    }

    shutdown(paths, &mut session);
    Ok(())
}

/// Decode one command line and dispatch it; the flag marks a `close`.
pub fn handle_line(session: &mut Session, line: &str) -> (Reply, bool) {
    match serde_json::from_str::<Value>(line.trim()) {
        Err(_) => (Reply::error("Invalid JSON"), false),
        Ok(value) => match serde_json::from_value::<Command>(value) {
            Err(err) => (Reply::error(format!("Invalid command: {err}")), false),
            Ok(command) => {
                log::debug!(target: "daemon", "dispatching {command:?}");
                let close_requested = matches!(command, Command::Close);
                (session.dispatch(command), close_requested)
            }
        },
    }
}

/// One command, one reply, then half-close.
pub fn serve_connection(session: &mut Session, mut stream: UnixStream) -> anyhow::Result<bool> {
    // accepted sockets may inherit the listener's non-blocking mode
    stream
        .set_nonblocking(false)
        .context("set connection blocking")?;
    stream
        .set_read_timeout(Some(SOCKET_READ_TIMEOUT))
        .context("set command read timeout")?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line).context("read command line")?;
    if line.trim().is_empty() {
        // readiness probes connect and hang up without a command
        return Ok(false);
    }

    let (reply, close_requested) = handle_line(session, &line);

    let mut encoded = serde_json::to_string(&reply)?;
    encoded.push('\n');
    stream.write_all(encoded.as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(Shutdown::Write);
    Ok(close_requested)
}

fn shutdown(paths: &SessionPaths, session: &mut Session) {
    // escape hatch if adapter teardown wedges
    thread::spawn(|| {
        thread::sleep(CLEANUP_ESCAPE);
        std::process::exit(1);
    });
    session.close();
    weak_error!(fs::remove_file(paths.socket_path()));
    weak_error!(fs::remove_file(paths.pid_path()));
    log::info!(target: "daemon", "shut down cleanly");
}

// ---------------------------------- CLI side -------------------------------------------------

/// Make sure a daemon is serving the socket: reap stale artifacts, spawn a
/// detached daemon if needed, and wait for the socket to come up.
pub fn ensure_running(paths: &SessionPaths) -> anyhow::Result<()> {
    if let Some(pid) = live_daemon_pid(paths) {
        log::debug!(target: "daemon", "daemon already running with pid {pid}");
        return Ok(());
    }
    reap_stale(paths);
    spawn_detached(paths)?;
    wait_for_socket(paths)
}

fn live_daemon_pid(paths: &SessionPaths) -> Option<i32> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = fs::read_to_string(paths.pid_path()).ok()?;
    let pid: i32 = raw.trim().parse().ok()?;
    // signal 0: existence probe only
    kill(Pid::from_raw(pid), None::<Signal>).ok()?;
    Some(pid)
}

fn reap_stale(paths: &SessionPaths) {
    if paths.socket_path().exists() || paths.pid_path().exists() {
        log::info!(target: "daemon", "reaping stale daemon artifacts");
        let _ = fs::remove_file(paths.socket_path());
        let _ = fs::remove_file(paths.pid_path());
    }
}

fn spawn_detached(paths: &SessionPaths) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    fs::create_dir_all(&paths.dir)?;
    let log_file = fs::File::create(paths.log_path()).context("create daemon log file")?;
    let exe = std::env::current_exe().context("resolve own executable")?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log_file))
        .process_group(0)
        .spawn()
        .context("spawn daemon")?;
    Ok(())
}

fn wait_for_socket(paths: &SessionPaths) -> anyhow::Result<()> {
    let socket = paths.socket_path();
    for _ in 0..SPAWN_POLL_ATTEMPTS {
        if UnixStream::connect(&socket).is_ok() {
            return Ok(());
        }
        thread::sleep(SPAWN_POLL_DELAY);
    }
    bail!(
        "daemon did not come up on {}, see {}",
        socket.display(),
        paths.log_path().display()
    )
}

/// Send one command to the daemon and read its reply.
pub fn call(paths: &SessionPaths, command: &Command) -> anyhow::Result<Reply> {
    let mut stream =
        UnixStream::connect(paths.socket_path()).context("connect to debugger daemon")?;
    let mut encoded = serde_json::to_string(command)?;
    encoded.push('\n');
    stream.write_all(encoded.as_bytes())?;
    stream.flush()?;
    let _ = stream.shutdown(Shutdown::Write);

    // verbs like `continue` block until the debuggee stops: no read timeout
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).context("read daemon reply")?;
    if line.trim().is_empty() {
        bail!("daemon closed the connection without a reply");
    }
    Ok(serde_json::from_str(line.trim())?)
}

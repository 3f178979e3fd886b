//! Native-debugger PID injection.
//!
//! Grafts a DAP server into a running Python process: a batch-mode lldb
//! (macOS) or gdb (Linux) attaches to the target, takes the GIL, runs a
//! short source string through `PyRun_SimpleString` that makes the process
//! call `debugpy.listen`, releases the GIL and detaches. The injected
//! listener spawns its own adapter subprocess, so the caller must allow a
//! grace period before connecting.
//!
//! Kept separate from the DAP core so other languages can add their own
//! injectors without touching it.

use crate::adapters::free_port;
use crate::error::{Error, Result};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Generous: the injected source may have to pip-install debugpy first.
const INJECTOR_TIMEOUT: Duration = Duration::from_secs(90);
/// Time for the in-process listener to spawn its adapter subprocess.
const LISTEN_GRACE: Duration = Duration::from_secs(3);

const PIP_HINT: &str =
    "install debugpy in the target's environment: `python -m pip install debugpy`";

/// Inject a debugpy listener into `pid`; returns the loopback port it
/// listens on.
pub fn inject_python(pid: i32, _runtime: Option<&str>) -> Result<u16> {
    ensure_process_exists(pid)?;
    let port = free_port()?;
    let source = listen_source(port);

    let mut injector = spawn_injector(pid, &source)?;
    log::info!(target: "inject", "driving native debugger against pid {pid}, port {port}");

    let status = match wait_for_exit(&mut injector, INJECTOR_TIMEOUT) {
        Some(status) => status,
        None => {
            let _ = injector.kill();
            return Err(Error::Injection(format!(
                "native debugger did not finish within {INJECTOR_TIMEOUT:?}"
            )));
        }
    };

    let mut stdout = String::new();
    if let Some(mut out) = injector.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }
    let mut stderr = String::new();
    if let Some(mut err) = injector.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }
    log::debug!(target: "inject", "injector stdout:\n{stdout}");

    if !status.success() {
        return Err(Error::Injection(format!(
            "native debugger exited with {status}: {}",
            stderr.lines().last().unwrap_or("no diagnostics"),
        )));
    }
    match parse_run_result(&stdout) {
        Some(0) => {}
        Some(code) => {
            return Err(Error::Injection(format!(
                "PyRun_SimpleString returned {code}; {PIP_HINT}"
            )));
        }
        None => {
            return Err(Error::Injection(format!(
                "could not determine PyRun_SimpleString result; {PIP_HINT}"
            )));
        }
    }

    thread::sleep(LISTEN_GRACE);
    Ok(port)
}

fn ensure_process_exists(pid: i32) -> Result<()> {
    use sysinfo::{RefreshKind, System};

    let sys = System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
    let process = sys
        .process(sysinfo::Pid::from_u32(pid as u32))
        .ok_or(Error::ProcessNotFound(pid))?;
    if let Some(exe) = process.exe() {
        log::debug!(target: "inject", "target pid {pid} runs {}", exe.display());
    }
    Ok(())
}

/// The program text run inside the target. Single-quoted strings only, so it
/// embeds verbatim in a double-quoted native-debugger string literal.
fn listen_source(port: u16) -> String {
    [
        "import sys".to_string(),
        "try:".to_string(),
        "    import debugpy".to_string(),
        "except ImportError:".to_string(),
        "    import subprocess".to_string(),
        "    subprocess.check_call([sys.executable, '-m', 'pip', 'install', 'debugpy'])"
            .to_string(),
        "    import debugpy".to_string(),
        format!("debugpy.listen(('127.0.0.1', {port}))"),
    ]
    .join("\\n")
}

#[cfg(target_os = "macos")]
fn spawn_injector(pid: i32, source: &str) -> Result<Child> {
    Ok(Command::new("lldb")
        .args(["--batch", "-p", &pid.to_string()])
        .args(["-o", "expr void * $gil = (void *)PyGILState_Ensure()"])
        .args([
            "-o",
            &format!("expr int $ret = (int)PyRun_SimpleString(\"{source}\")"),
        ])
        .args(["-o", "expr (void)PyGILState_Release($gil)"])
        .args(["-o", "p $ret"])
        .args(["-o", "detach"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?)
}

#[cfg(not(target_os = "macos"))]
fn spawn_injector(pid: i32, source: &str) -> Result<Child> {
    Ok(Command::new("gdb")
        .args(["-p", &pid.to_string(), "--batch", "-nx"])
        .args(["-ex", "set $gil = (void *)PyGILState_Ensure()"])
        .args([
            "-ex",
            &format!("set $ret = (int)PyRun_SimpleString(\"{source}\")"),
        ])
        .args(["-ex", "call (void)PyGILState_Release($gil)"])
        .args(["-ex", "printf \"PYRUN_RESULT=%d\\n\", $ret"])
        .args(["-ex", "detach"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?)
}

/// Find the `PyRun_SimpleString` return value in the injector transcript.
/// gdb prints `PYRUN_RESULT=<n>`, lldb prints the convenience variable as
/// `(int) $ret = <n>`.
fn parse_run_result(stdout: &str) -> Option<i32> {
    for line in stdout.lines().rev() {
        if let Some(rest) = line.trim().strip_prefix("PYRUN_RESULT=") {
            return rest.trim().parse().ok();
        }
        if line.contains("$ret = ")
            && let Some((_, value)) = line.rsplit_once("= ")
            && let Ok(code) = value.trim().parse()
        {
            return Some(code);
        }
    }
    None
}

pub(crate) fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return None;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gdb_result_line() {
        let out = "Attaching to process 123\nPYRUN_RESULT=0\nDetaching\n";
        assert_eq!(parse_run_result(out), Some(0));
        assert_eq!(parse_run_result("PYRUN_RESULT=-1\n"), Some(-1));
    }

    #[test]
    fn parses_lldb_result_line() {
        let out = "(lldb) expr int $ret = (int)PyRun_SimpleString(\"...\")\n(int) $ret = 0\n";
        assert_eq!(parse_run_result(out), Some(0));
    }

    #[test]
    fn missing_result_is_none() {
        assert_eq!(parse_run_result("nothing of note"), None);
    }

    #[test]
    fn listen_source_is_embeddable() {
        let source = listen_source(4711);
        assert!(!source.contains('"'));
        assert!(source.contains("debugpy.listen(('127.0.0.1', 4711))"));
    }
}

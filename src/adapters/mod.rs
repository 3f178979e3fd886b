//! Per-language debug adapter strategies.
//!
//! Each supported language knows how to locate and spawn its adapter, what
//! its DAP `initialize`/`launch`/`attach` bodies look like, optionally how to
//! graft a DAP server into a running process by pid, and which frames and
//! variables are internal noise. The handshake itself is shared: see
//! [`handshake`].

pub mod go;
pub mod handshake;
pub mod inject;
pub mod native;
pub mod node;
pub mod python;

use crate::error::{Error, Result};
use dap::types::{StackFrame, Variable};
use serde_json::Value;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Child;

/// A breakpoint request parsed from the CLI `file:line[:condition]` grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub file: PathBuf,
    pub line: i64,
    pub condition: Option<String>,
}

impl BreakpointSpec {
    /// Parse `file:line[:condition]`. The condition may itself contain `:`,
    /// everything after the second colon is re-joined. Malformed specs yield
    /// `None` and are skipped by callers.
    pub fn parse(spec: &str) -> Option<BreakpointSpec> {
        let mut parts = spec.split(':');
        let file = parts.next()?;
        if file.is_empty() {
            return None;
        }
        let line: i64 = parts.next()?.trim().parse().ok()?;
        if line < 1 {
            return None;
        }
        let condition = {
            let rest = parts.collect::<Vec<_>>().join(":");
            (!rest.is_empty()).then_some(rest)
        };
        Some(BreakpointSpec {
            file: PathBuf::from(file),
            line,
            condition,
        })
    }

    /// Group specs per file, preserving order. DAP `setBreakpoints` replaces
    /// the whole set for a file, so each file must be sent in one request.
    pub fn group_by_file(specs: &[BreakpointSpec]) -> Vec<(PathBuf, Vec<&BreakpointSpec>)> {
        let mut groups: Vec<(PathBuf, Vec<&BreakpointSpec>)> = Vec::new();
        for spec in specs {
            match groups.iter_mut().find(|(file, _)| *file == spec.file) {
                Some((_, group)) => group.push(spec),
                None => groups.push((spec.file.clone(), vec![spec])),
            }
        }
        groups
    }
}

/// What to launch and how.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
    /// Interpreter/toolchain override (`--runtime`).
    pub runtime: Option<String>,
}

/// An already-running debuggee: either a DAP server address or a raw pid to
/// inject into.
#[derive(Debug, Clone)]
pub enum AttachTarget {
    Tcp { host: String, port: u16 },
    Pid(i32),
}

/// Adapter spawned for a session: the child process listening on a loopback
/// port, or just the port when the server lives inside the debuggee
/// (pid injection).
pub struct SpawnedAdapter {
    pub child: Option<Child>,
    pub port: u16,
}

pub trait AdapterStrategy: Send {
    fn language(&self) -> &'static str;

    /// Quick verification that the adapter tooling is present.
    fn check_installed(&self, runtime: Option<&str>) -> Result<()>;

    /// Launch the adapter listening on a fresh loopback port.
    fn spawn_adapter(&self, opts: &LaunchOptions) -> Result<SpawnedAdapter>;

    fn initialize_args(&self) -> Value;

    fn launch_args(&self, opts: &LaunchOptions) -> Value;

    fn attach_args(&self, target: &AttachTarget) -> Value;

    /// Graft a DAP server into a running process; returns the loopback port
    /// the server listens on.
    fn inject(&self, _pid: i32, _runtime: Option<&str>) -> Result<SpawnedAdapter> {
        Err(Error::InjectUnsupported(self.language()))
    }

    fn is_internal_frame(&self, _frame: &StackFrame) -> bool {
        false
    }

    fn is_internal_variable(&self, _var: &Variable) -> bool {
        false
    }
}

/// Pick a strategy from an explicit language name or the script's extension.
pub fn strategy_for(language: Option<&str>, script: &Path) -> Result<Box<dyn AdapterStrategy>> {
    if let Some(lang) = language {
        return strategy_by_name(lang);
    }
    match script.extension().and_then(|e| e.to_str()) {
        Some("py") => Ok(Box::new(python::PythonAdapter)),
        Some("js") | Some("mjs") | Some("cjs") | Some("ts") => Ok(Box::new(node::NodeAdapter)),
        Some("go") => Ok(Box::new(go::GoAdapter)),
        Some("rs") | Some("c") | Some("cc") | Some("cpp") => Ok(Box::new(native::NativeAdapter)),
        // extensionless executables are native binaries
        None if script.is_file() => Ok(Box::new(native::NativeAdapter)),
        _ => Err(Error::LanguageDetect(script.to_path_buf())),
    }
}

pub fn strategy_by_name(language: &str) -> Result<Box<dyn AdapterStrategy>> {
    match language.to_ascii_lowercase().as_str() {
        "python" | "py" => Ok(Box::new(python::PythonAdapter)),
        "node" | "js" | "javascript" | "ts" | "typescript" => Ok(Box::new(node::NodeAdapter)),
        "go" | "golang" => Ok(Box::new(go::GoAdapter)),
        "rust" | "c" | "cpp" | "c++" | "native" => Ok(Box::new(native::NativeAdapter)),
        other => Err(Error::UnknownLanguage(other.to_string())),
    }
}

/// Resolve a runtime binary: an explicit override is taken as-is (or looked
/// up on PATH), otherwise the first candidate found on PATH wins.
pub(crate) fn resolve_runtime(
    runtime: Option<&str>,
    candidates: &[&str],
    what: &str,
) -> Result<PathBuf> {
    if let Some(runtime) = runtime {
        let path = Path::new(runtime);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return which::which(runtime)
            .map_err(|_| Error::NotInstalled(format!("{what} `{runtime}` not found")));
    }
    for candidate in candidates {
        if let Ok(path) = which::which(candidate) {
            return Ok(path);
        }
    }
    Err(Error::NotInstalled(format!(
        "no {what} found on PATH (tried {})",
        candidates.join(", ")
    )))
}

/// Allocate a free loopback port by binding port 0 and dropping the listener.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_spec_grammar() {
        let spec = BreakpointSpec::parse("app.py:25").unwrap();
        assert_eq!(spec.file, PathBuf::from("app.py"));
        assert_eq!(spec.line, 25);
        assert_eq!(spec.condition, None);

        let spec = BreakpointSpec::parse("src/main.py:14:i == 3").unwrap();
        assert_eq!(spec.line, 14);
        assert_eq!(spec.condition.as_deref(), Some("i == 3"));
    }

    #[test]
    fn breakpoint_condition_rejoins_on_colon() {
        let spec = BreakpointSpec::parse("app.py:7:x == 'a:b:c'").unwrap();
        assert_eq!(spec.condition.as_deref(), Some("x == 'a:b:c'"));
    }

    #[test]
    fn malformed_breakpoints_are_rejected() {
        assert_eq!(BreakpointSpec::parse("app.py"), None);
        assert_eq!(BreakpointSpec::parse("app.py:zero"), None);
        assert_eq!(BreakpointSpec::parse("app.py:0"), None);
        assert_eq!(BreakpointSpec::parse(":12"), None);
        assert_eq!(BreakpointSpec::parse(""), None);
    }

    #[test]
    fn breakpoints_group_per_file() {
        let specs = vec![
            BreakpointSpec::parse("a.py:1").unwrap(),
            BreakpointSpec::parse("b.py:2").unwrap(),
            BreakpointSpec::parse("a.py:9:flag").unwrap(),
        ];
        let groups = BreakpointSpec::group_by_file(&specs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, PathBuf::from("a.py"));
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn language_detection_by_extension() {
        assert_eq!(
            strategy_for(None, Path::new("x.py")).unwrap().language(),
            "python"
        );
        assert_eq!(
            strategy_for(None, Path::new("x.ts")).unwrap().language(),
            "node"
        );
        assert_eq!(
            strategy_for(None, Path::new("x.go")).unwrap().language(),
            "go"
        );
        assert!(matches!(
            strategy_for(None, Path::new("x.rb")),
            Err(Error::LanguageDetect(_))
        ));
        assert!(matches!(
            strategy_by_name("cobol"),
            Err(Error::UnknownLanguage(_))
        ));
    }
}

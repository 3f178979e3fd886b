//! CodeLLDB strategy for compiled targets (Rust, C, C++). The adapter binary
//! comes from `CODELLDB_PATH`.

use crate::adapters::{AdapterStrategy, AttachTarget, LaunchOptions, SpawnedAdapter, free_port};
use crate::error::{Error, Result};
use dap::types::StackFrame;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub const CODELLDB_PATH_ENV: &str = "CODELLDB_PATH";

const INTERNAL_SYMBOL_PREFIXES: &[&str] = &["std::", "core::", "alloc::", "__"];

pub struct NativeAdapter;

impl NativeAdapter {
    fn adapter_binary(&self) -> Result<PathBuf> {
        let path = std::env::var(CODELLDB_PATH_ENV).map_err(|_| {
            Error::NotInstalled(format!(
                "{CODELLDB_PATH_ENV} is not set, point it at a codelldb adapter binary"
            ))
        })?;
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(Error::NotInstalled(format!(
                "codelldb binary {} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }
}

impl AdapterStrategy for NativeAdapter {
    fn language(&self) -> &'static str {
        "native"
    }

    fn check_installed(&self, _runtime: Option<&str>) -> Result<()> {
        self.adapter_binary().map(|_| ())
    }

    fn spawn_adapter(&self, _opts: &LaunchOptions) -> Result<SpawnedAdapter> {
        let codelldb = self.adapter_binary()?;
        let port = free_port()?;
        log::info!(target: "session", "spawning codelldb on port {port}");
        let child = Command::new(&codelldb)
            .args(["--port", &port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(SpawnedAdapter {
            child: Some(child),
            port,
        })
    }

    fn initialize_args(&self) -> Value {
        json!({
            "adapterID": "lldb",
            "clientID": "adbg",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path",
        })
    }

    fn launch_args(&self, opts: &LaunchOptions) -> Value {
        let mut args = json!({
            "program": opts.program,
            "args": opts.args,
            "stopOnEntry": opts.stop_on_entry,
        });
        if let Some(cwd) = &opts.cwd {
            args["cwd"] = json!(cwd);
        }
        args
    }

    fn attach_args(&self, target: &AttachTarget) -> Value {
        match target {
            AttachTarget::Pid(pid) => json!({ "pid": pid }),
            AttachTarget::Tcp { .. } => json!({}),
        }
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        if INTERNAL_SYMBOL_PREFIXES
            .iter()
            .any(|prefix| frame.name.starts_with(prefix))
        {
            return true;
        }
        match frame.source.as_ref().and_then(|s| s.path.as_ref()) {
            Some(path) => {
                path.starts_with("/usr/") || path.starts_with("/lib") || path.contains("/rustc/")
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dap::types::Source;

    #[test]
    fn stdlib_frames_are_filtered() {
        let adapter = NativeAdapter;
        let frame = StackFrame {
            id: 1,
            name: "std::panicking::begin_panic".to_string(),
            line: 1,
            column: 1,
            ..Default::default()
        };
        assert!(adapter.is_internal_frame(&frame));

        let frame = StackFrame {
            id: 2,
            name: "myapp::run".to_string(),
            source: Some(Source {
                path: Some("/home/me/src/main.rs".to_string()),
                ..Default::default()
            }),
            line: 3,
            column: 1,
            ..Default::default()
        };
        assert!(!adapter.is_internal_frame(&frame));
    }
}

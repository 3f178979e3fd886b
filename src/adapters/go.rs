//! Delve strategy for Go. `dlv dap` serves exactly one DAP session per
//! listener, which matches the one-session daemon.

use crate::adapters::{
    AdapterStrategy, AttachTarget, LaunchOptions, SpawnedAdapter, free_port, resolve_runtime,
};
use crate::error::Result;
use dap::types::StackFrame;
use serde_json::{Value, json};
use std::process::{Command, Stdio};

pub struct GoAdapter;

impl AdapterStrategy for GoAdapter {
    fn language(&self) -> &'static str {
        "go"
    }

    fn check_installed(&self, runtime: Option<&str>) -> Result<()> {
        resolve_runtime(runtime, &["dlv"], "delve (dlv)").map(|_| ())
    }

    fn spawn_adapter(&self, opts: &LaunchOptions) -> Result<SpawnedAdapter> {
        let dlv = resolve_runtime(opts.runtime.as_deref(), &["dlv"], "delve (dlv)")?;
        let port = free_port()?;
        log::info!(target: "session", "spawning dlv dap on port {port}");
        let child = Command::new(&dlv)
            .args(["dap", "--listen", &format!("127.0.0.1:{port}")])
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
            "adapterID": "go",
            "clientID": "adbg",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path",
        })
    }

    fn launch_args(&self, opts: &LaunchOptions) -> Value {
        let mut args = json!({
            "request": "launch",
            "mode": "debug",
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
            AttachTarget::Pid(pid) => json!({ "mode": "local", "processId": pid }),
            AttachTarget::Tcp { .. } => json!({ "mode": "local" }),
        }
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        if frame.name.starts_with("runtime.") {
            return true;
        }
        match frame.source.as_ref().and_then(|s| s.path.as_ref()) {
            Some(path) => {
                path.contains("/usr/local/go/") || path.contains("/libexec/go/") || path.contains("/go/pkg/mod/")
            }
            None => true,
        }
    }
}

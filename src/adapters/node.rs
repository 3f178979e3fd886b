//! js-debug strategy for Node/JS/TS. Expects a js-debug checkout via
//! `JS_DEBUG_PATH` (the directory containing `src/dapDebugServer.js`).

use crate::adapters::{
    AdapterStrategy, AttachTarget, LaunchOptions, SpawnedAdapter, free_port, resolve_runtime,
};
use crate::error::{Error, Result};
use dap::types::{StackFrame, Variable};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::{Command, Stdio};

pub const JS_DEBUG_PATH_ENV: &str = "JS_DEBUG_PATH";

pub struct NodeAdapter;

impl NodeAdapter {
    fn dap_server(&self) -> Result<PathBuf> {
        let root = std::env::var(JS_DEBUG_PATH_ENV).map_err(|_| {
            Error::NotInstalled(format!(
                "{JS_DEBUG_PATH_ENV} is not set, point it at a js-debug install"
            ))
        })?;
        let server = PathBuf::from(root).join("src").join("dapDebugServer.js");
        if !server.is_file() {
            return Err(Error::NotInstalled(format!(
                "{} does not exist, {JS_DEBUG_PATH_ENV} must name a js-debug install root",
                server.display()
            )));
        }
        Ok(server)
    }
}

impl AdapterStrategy for NodeAdapter {
    fn language(&self) -> &'static str {
        "node"
    }

    fn check_installed(&self, runtime: Option<&str>) -> Result<()> {
        resolve_runtime(runtime, &["node"], "node runtime")?;
        self.dap_server().map(|_| ())
    }

    fn spawn_adapter(&self, opts: &LaunchOptions) -> Result<SpawnedAdapter> {
        let node = resolve_runtime(opts.runtime.as_deref(), &["node"], "node runtime")?;
        let server = self.dap_server()?;
        let port = free_port()?;
        log::info!(target: "session", "spawning js-debug on port {port}");
        let child = Command::new(&node)
            .arg(&server)
            .arg(port.to_string())
            .arg("127.0.0.1")
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
            "adapterID": "pwa-node",
            "clientID": "adbg",
            "linesStartAt1": true,
            "columnsStartAt1": true,
            "pathFormat": "path",
        })
    }

    fn launch_args(&self, opts: &LaunchOptions) -> Value {
        let mut args = json!({
            "type": "pwa-node",
            "request": "launch",
            "program": opts.program,
            "args": opts.args,
            "console": "internalConsole",
            "sourceMaps": true,
            "stopOnEntry": opts.stop_on_entry,
        });
        if let Some(cwd) = &opts.cwd {
            args["cwd"] = json!(cwd);
        }
        args
    }

    fn attach_args(&self, _target: &AttachTarget) -> Value {
        json!({ "type": "pwa-node", "request": "attach" })
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        match frame.source.as_ref().and_then(|s| s.path.as_ref()) {
            Some(path) => {
                path.contains("node_modules")
                    || path.starts_with("node:")
                    || path.contains("internal/")
            }
            None => true,
        }
    }

    fn is_internal_variable(&self, var: &Variable) -> bool {
        var.name.starts_with("__") || var.name.starts_with("[[")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dap::types::Source;

    fn frame(path: &str) -> StackFrame {
        StackFrame {
            id: 1,
            name: "f".to_string(),
            source: Some(Source {
                path: Some(path.to_string()),
                ..Default::default()
            }),
            line: 1,
            column: 1,
            ..Default::default()
        }
    }

    #[test]
    fn runtime_internals_are_filtered() {
        let adapter = NodeAdapter;
        assert!(adapter.is_internal_frame(&frame("node:internal/modules/cjs/loader")));
        assert!(adapter.is_internal_frame(&frame("/app/node_modules/express/lib/router.js")));
        assert!(!adapter.is_internal_frame(&frame("/app/server.js")));
    }
}

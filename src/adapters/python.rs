//! debugpy strategy. The adapter is spawned as `python -m debugpy.adapter`;
//! pid attach goes through native-debugger injection (see [`crate::adapters::inject`]).

use crate::adapters::{
    AdapterStrategy, AttachTarget, LaunchOptions, SpawnedAdapter, free_port, inject,
    resolve_runtime,
};
use crate::error::{Error, Result};
use dap::types::{StackFrame, Variable};
use serde_json::{Value, json};
use std::process::{Command, Stdio};

/// Synthetic grouping nodes debugpy reports alongside real locals.
const SYNTHETIC_VARIABLES: &[&str] = &[
    "special variables",
    "function variables",
    "class variables",
    "protected variables",
];

pub struct PythonAdapter;

impl PythonAdapter {
    fn python(&self, runtime: Option<&str>) -> Result<std::path::PathBuf> {
        resolve_runtime(runtime, &["python3", "python"], "python interpreter")
    }
}

impl AdapterStrategy for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
    }

    fn check_installed(&self, runtime: Option<&str>) -> Result<()> {
        let python = self.python(runtime)?;
        let status = Command::new(&python)
            .args(["-c", "import debugpy"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(Error::NotInstalled(format!(
                "debugpy is not importable by {}, install it with `{} -m pip install debugpy`",
                python.display(),
                python.display(),
            )));
        }
        Ok(())
    }

    fn spawn_adapter(&self, opts: &LaunchOptions) -> Result<SpawnedAdapter> {
        let python = self.python(opts.runtime.as_deref())?;
        let port = free_port()?;
        log::info!(target: "session", "spawning debugpy adapter on port {port}");
        let child = Command::new(&python)
            .args([
                "-m",
                "debugpy.adapter",
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
            ])
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
            "adapterID": "debugpy",
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
            "console": "internalConsole",
            "justMyCode": false,
            "redirectOutput": true,
            "stopOnEntry": opts.stop_on_entry,
        });
        if let Some(cwd) = &opts.cwd {
            args["cwd"] = json!(cwd);
        }
        if let Some(python) = &opts.runtime {
            args["python"] = json!(python);
        }
        args
    }

    fn attach_args(&self, _target: &AttachTarget) -> Value {
        // the server already knows its target, whether started by
        // `debugpy.listen` or by injection
        json!({ "justMyCode": false })
    }

    fn inject(&self, pid: i32, runtime: Option<&str>) -> Result<SpawnedAdapter> {
        let port = inject::inject_python(pid, runtime)?;
        // the DAP server lives inside the target, there is no child to own
        Ok(SpawnedAdapter { child: None, port })
    }

    fn is_internal_frame(&self, frame: &StackFrame) -> bool {
        match frame.source.as_ref().and_then(|s| s.path.as_ref()) {
            Some(path) => {
                path.contains("debugpy") || path.contains("pydevd") || path.starts_with('<')
            }
            // frozen importlib and friends come without a source path
            None => true,
        }
    }

    fn is_internal_variable(&self, var: &Variable) -> bool {
        (var.name.starts_with("__") && var.name.ends_with("__"))
            || SYNTHETIC_VARIABLES.contains(&var.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dap::types::Source;

    fn frame(path: Option<&str>) -> StackFrame {
        StackFrame {
            id: 1,
            name: "f".to_string(),
            source: path.map(|p| Source {
                path: Some(p.to_string()),
                ..Default::default()
            }),
            line: 1,
            column: 1,
            ..Default::default()
        }
    }

    fn var(name: &str) -> Variable {
        Variable {
            name: name.to_string(),
            value: String::new(),
            ..Default::default()
        }
    }

    #[test]
    fn debugger_machinery_frames_are_internal() {
        let adapter = PythonAdapter;
        assert!(adapter.is_internal_frame(&frame(Some("/lib/python3.12/site-packages/debugpy/x.py"))));
        assert!(adapter.is_internal_frame(&frame(Some("/x/pydevd_bundle/pydevd_frame.py"))));
        assert!(adapter.is_internal_frame(&frame(Some("<frozen importlib._bootstrap>"))));
        assert!(adapter.is_internal_frame(&frame(None)));
        assert!(!adapter.is_internal_frame(&frame(Some("/home/me/app.py"))));
    }

    #[test]
    fn dunder_and_synthetic_variables_are_internal() {
        let adapter = PythonAdapter;
        assert!(adapter.is_internal_variable(&var("__name__")));
        assert!(adapter.is_internal_variable(&var("special variables")));
        assert!(!adapter.is_internal_variable(&var("_private")));
        assert!(!adapter.is_internal_variable(&var("data")));
    }
}


use agent_debugger::adapters::handshake::{self, StopOutcome};
use agent_debugger::adapters::python::PythonAdapter;
use agent_debugger::adapters::{BreakpointSpec, LaunchOptions};
use agent_debugger::dap::DapClient;
use agent_debugger::proto::{Command, StepKind};
use agent_debugger::session::{Session, SessionState};
use mock_adapter::{MockAdapter, MockScript, Outcome};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn connect(mock: &MockAdapter) -> DapClient {
    DapClient::connect("127.0.0.1", mock.port, CONNECT_TIMEOUT).expect("connect to mock")
}

fn attach_command(mock: &MockAdapter, breakpoints: Vec<String>) -> Command {
    Command::Attach {
        host: None,
        port: Some(mock.port),
        pid: None,
        language: Some("python".to_string()),
        runtime: None,
        breakpoints,
    }
}

#[test]
fn launch_handshake_with_deferred_response() -> anyhow::Result<()> {
    let mock = MockAdapter::spawn(MockScript::default())?;
    let mut client = connect(&mock);

    let breakpoints = vec![BreakpointSpec {
        file: PathBuf::from("/work/app.py"),
        line: 25,
        condition: Some("i == 3".to_string()),
    }];
    let handshake = handshake::init_flow(
        &mut client,
        &PythonAdapter,
        &LaunchOptions {
            program: PathBuf::from("/work/app.py"),
            ..Default::default()
        },
        &breakpoints,
    )?;

    match handshake.outcome {
        StopOutcome::Paused { thread_id, ref reason } => {
            assert_eq!(thread_id, 1);
            assert_eq!(reason, "breakpoint");
        }
        other => panic!("expected a pause, got {other:?}"),
    }
    assert_eq!(handshake.breakpoints.len(), 1);
    assert!(handshake.breakpoints[0].verified);
    assert_eq!(handshake.breakpoints[0].line, 25);

    // the launch response is deferred, so configuration must fully precede it
    assert_eq!(
        mock.command_order(),
        vec![
            "initialize",
            "launch",
            "setBreakpoints",
            "setExceptionBreakpoints",
            "configurationDone",
        ]
    );

    // conditions ride along verbatim
    let set = mock.request("setBreakpoints").unwrap();
    assert_eq!(set["arguments"]["breakpoints"][0]["condition"], "i == 3");

    client.disconnect(true);
    mock.join();
    Ok(())
}

#[test]
fn stopped_event_before_launch_response_is_tolerated() -> anyhow::Result<()> {
    let mock = MockAdapter::spawn(MockScript {
        events_before_start_response: true,
        ..Default::default()
    })?;
    let mut client = connect(&mock);

    let handshake = handshake::init_flow(
        &mut client,
        &PythonAdapter,
        &LaunchOptions::default(),
        &[],
    )?;
    assert!(matches!(handshake.outcome, StopOutcome::Paused { .. }));

    client.disconnect(true);
    mock.join();
    Ok(())
}

#[test]
fn launch_that_terminates_reports_exit_code() -> anyhow::Result<()> {
    let mock = MockAdapter::spawn(MockScript {
        initial: Outcome::exit(3),
        ..Default::default()
    })?;
    let mut client = connect(&mock);

    let handshake = handshake::init_flow(
        &mut client,
        &PythonAdapter,
        &LaunchOptions::default(),
        &[],
    )?;
    match handshake.outcome {
        StopOutcome::Terminated { exit_code } => assert_eq!(exit_code, Some(3)),
        other => panic!("expected termination, got {other:?}"),
    }

    client.disconnect(true);
    mock.join();
    Ok(())
}

#[test]
fn attach_session_runs_the_full_verb_surface() -> anyhow::Result<()> {
    // the initial stop at 25 is queued by the handshake itself; `step` and
    // the final `continue` consume these two
    let mock = MockAdapter::spawn(MockScript {
        resume: vec![Outcome::stop(14), Outcome::exit(0)],
        ..Default::default()
    })?;

    let mut session = Session::new();
    let reply = session.dispatch(attach_command(&mock, vec!["/work/app.py:25".to_string()]));
    assert_eq!(reply.error, None);
    assert_eq!(reply.state.as_deref(), Some("running"));
    assert_eq!(session.state(), SessionState::Running);

    // a second session on top of the live one is rejected
    let rejected = session.dispatch(Command::Start {
        script: "other.py".to_string(),
        language: None,
        breakpoints: vec![],
        runtime: None,
        args: vec![],
        cwd: None,
        stop_on_entry: false,
    });
    assert!(rejected.error.unwrap().contains("already active"));

    // continue after attach only waits for the stop that is already queued
    let reply = session.dispatch(Command::Continue);
    assert_eq!(reply.state.as_deref(), Some("paused"));
    let location = reply.location.expect("pause location");
    assert_eq!(location.file, "/work/app.py");
    assert_eq!(location.line, 25);
    assert_eq!(location.function, "process");

    // locals are filtered: dunders and debugpy synthetics vanish
    let reply = session.dispatch(Command::Vars);
    let variables = reply.variables.expect("variables");
    assert_eq!(variables.len(), 1);
    assert_eq!(variables[0].name, "data");
    assert_eq!(variables[0].r#type.as_deref(), Some("dict"));

    // the debugpy machinery frame is dropped, user frames stay
    let reply = session.dispatch(Command::Stack);
    let frames = reply.frames.expect("frames");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].name, "process");
    assert_eq!(frames[1].name, "<module>");

    let reply = session.dispatch(Command::Eval {
        expression: "data['age']".to_string(),
    });
    assert_eq!(reply.result.as_deref(), Some("'35'"));
    assert_eq!(reply.r#type.as_deref(), Some("str"));

    // adapter-side evaluation failures surface as the adapter's message
    let reply = session.dispatch(Command::Eval {
        expression: "missing".to_string(),
    });
    assert!(reply.error.unwrap().contains("NameError"));
    assert_eq!(session.state(), SessionState::Paused);

    let reply = session.dispatch(Command::Step {
        kind: Some(StepKind::Over),
    });
    assert_eq!(reply.state.as_deref(), Some("paused"));
    assert_eq!(reply.location.unwrap().line, 14);

    let reply = session.dispatch(Command::Continue);
    assert_eq!(reply.state.as_deref(), Some("terminated"));
    assert_eq!(reply.exit_code, Some(0));
    assert_eq!(session.state(), SessionState::Terminated);

    let reply = session.dispatch(Command::Close);
    assert_eq!(reply.state.as_deref(), Some("idle"));
    assert_eq!(session.state(), SessionState::Idle);

    // attached mode: closing must not terminate the debuggee
    let disconnect = mock.request("disconnect").expect("disconnect sent");
    assert_eq!(disconnect["arguments"]["terminateDebuggee"], Value::Bool(false));

    // the step verb really used `next`
    assert!(mock.command_order().iter().any(|c| c == "next"));
    mock.join();
    Ok(())
}

#[test]
fn eval_leaves_state_and_location_alone() -> anyhow::Result<()> {
    let mock = MockAdapter::spawn(MockScript::default())?;

    let mut session = Session::new();
    session.dispatch(attach_command(&mock, vec![]));
    let paused = session.dispatch(Command::Continue);
    let before = paused.location.expect("location");

    session.dispatch(Command::Eval {
        expression: "data['age']".to_string(),
    });

    let status = session.dispatch(Command::Status);
    assert_eq!(status.state.as_deref(), Some("paused"));
    assert_eq!(status.location.expect("location"), before);

    session.dispatch(Command::Close);
    mock.join();
    Ok(())
}

#[test]
fn close_then_reattach_restores_a_working_session() -> anyhow::Result<()> {
    let mut session = Session::new();

    let first = MockAdapter::spawn(MockScript::default())?;
    session.dispatch(attach_command(&first, vec![]));
    assert_eq!(session.state(), SessionState::Running);
    session.dispatch(Command::Close);
    assert_eq!(session.state(), SessionState::Idle);
    first.join();

    let second = MockAdapter::spawn(MockScript::default())?;
    let reply = session.dispatch(attach_command(&second, vec![]));
    assert_eq!(reply.error, None);
    let reply = session.dispatch(Command::Continue);
    assert_eq!(reply.state.as_deref(), Some("paused"));
    session.dispatch(Command::Close);
    second.join();
    Ok(())
}

#[test]
fn mid_session_breakpoint_reaches_the_adapter() -> anyhow::Result<()> {
    let mock = MockAdapter::spawn(MockScript {
        resume: vec![Outcome::stop(31)],
        ..Default::default()
    })?;

    let mut session = Session::new();
    session.dispatch(attach_command(&mock, vec!["/work/app.py:25".to_string()]));
    session.dispatch(Command::Continue);

    let reply = session.dispatch(Command::Break {
        file: "/work/app.py".to_string(),
        line: 31,
        condition: None,
    });
    let breakpoints = reply.breakpoints.expect("breakpoints");
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0].line, 31);
    assert!(breakpoints[0].verified);

    let reply = session.dispatch(Command::Continue);
    assert_eq!(reply.state.as_deref(), Some("paused"));
    assert_eq!(reply.location.unwrap().line, 31);

    session.dispatch(Command::Close);
    mock.join();
    Ok(())
}

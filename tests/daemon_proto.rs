use agent_debugger::daemon::{self, SessionPaths};
use agent_debugger::proto::Reply;
use agent_debugger::session::Session;
use serial_test::serial;
use std::io::{BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

fn roundtrip_threaded(session: &mut Session, line: String) -> (Reply, bool) {
    let (client, server) = UnixStream::pair().expect("socketpair");
    let writer = thread::spawn(move || {
        let mut client = client;
        client.write_all(line.as_bytes()).expect("write command");
        client.write_all(b"\n").expect("write newline");
        let _ = client.shutdown(Shutdown::Write);
        let mut reply = String::new();
        BufReader::new(&client)
            .read_line(&mut reply)
            .expect("read reply");
        reply
    });

    let close = daemon::serve_connection(session, server).expect("serve connection");
    let reply_line = writer.join().expect("writer thread");
    let reply: Reply = serde_json::from_str(reply_line.trim()).expect("decode reply");
    (reply, close)
}

#[test]
#[serial]
fn malformed_json_gets_the_canonical_error() {
    let mut session = Session::new();
    let (reply, close) = roundtrip_threaded(&mut session, "{not json".to_string());
    assert_eq!(reply.error.as_deref(), Some("Invalid JSON"));
    assert!(!close);
}

#[test]
#[serial]
fn schema_violations_are_reported_without_state_change() {
    let mut session = Session::new();

    let (reply, _) = roundtrip_threaded(&mut session, r#"{"action":"warp"}"#.to_string());
    assert!(reply.error.unwrap().starts_with("Invalid command:"));

    // a valid JSON object that is no command at all
    let (reply, _) = roundtrip_threaded(&mut session, r#"{"foo":1}"#.to_string());
    assert!(reply.error.unwrap().starts_with("Invalid command:"));

    // eval without its required field
    let (reply, _) = roundtrip_threaded(&mut session, r#"{"action":"eval"}"#.to_string());
    assert!(reply.error.unwrap().starts_with("Invalid command:"));

    let (reply, _) = roundtrip_threaded(&mut session, r#"{"action":"status"}"#.to_string());
    assert_eq!(reply.state.as_deref(), Some("idle"));
}

#[test]
#[serial]
fn close_flags_the_daemon_for_shutdown() {
    let mut session = Session::new();
    let (reply, close) = roundtrip_threaded(&mut session, r#"{"action":"close"}"#.to_string());
    assert_eq!(reply.state.as_deref(), Some("idle"));
    assert!(close);
}

#[test]
#[serial]
fn state_preconditions_travel_the_wire() {
    let mut session = Session::new();
    let (reply, _) = roundtrip_threaded(&mut session, r#"{"action":"vars"}"#.to_string());
    assert!(reply.error.unwrap().contains("paused"));
}

#[test]
fn session_paths_land_in_the_session_directory() {
    let paths = SessionPaths::at(PathBuf::from("/tmp/adbg-test"));
    assert_eq!(paths.socket_path(), PathBuf::from("/tmp/adbg-test/daemon.sock"));
    assert_eq!(paths.pid_path(), PathBuf::from("/tmp/adbg-test/daemon.pid"));
    assert_eq!(paths.log_path(), PathBuf::from("/tmp/adbg-test/daemon.log"));
}

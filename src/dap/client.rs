//! Correlated DAP client over a TCP connection to a debug adapter.
//!
//! The client is single-consumer: every read happens on the calling thread,
//! and at most one synchronous request is pumped for at a time (the session
//! issues DAP requests strictly one per verb). Responses that arrive while
//! the pump waits for something else land either in the deferred-response
//! map (when a slot was opened with [`DapClient::request_async`]) or on the
//! floor; events are queued in arrival order.

use crate::dap::{DapEvent, DapRequest, DapResponse, Message, transport};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const READ_TICK: Duration = Duration::from_millis(100);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DapClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_seq: i64,
    /// Deferred response slots opened by `request_async`, filled by the pump.
    deferred: HashMap<i64, Option<DapResponse>>,
    events: VecDeque<DapEvent>,
}

impl DapClient {
    /// Connect to an adapter, retrying until `timeout`. Adapters often need
    /// a moment after spawn before they accept.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let start = Instant::now();
        let stream = loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => break stream,
                Err(err) => {
                    if start.elapsed() > timeout {
                        log::error!(target: "dap", "connect to {addr} failed: {err}");
                        return Err(Error::Timeout(format!("connection to {addr}")));
                    }
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        };
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TICK))?;
        stream.set_write_timeout(Some(DEFAULT_REQUEST_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);
        log::debug!(target: "dap", "connected to adapter at {addr}");
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
            deferred: HashMap::new(),
            events: VecDeque::new(),
        })
    }

    fn send(&mut self, command: &str, arguments: Value) -> Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = DapRequest {
            seq,
            r#type: "request",
            command: command.to_string(),
            arguments,
        };
        log::debug!(target: "dap", "-> {seq} {command}");
        transport::write_message(&mut self.stream, &request)?;
        Ok(seq)
    }

    /// Send a request and suspend until its response arrives or `timeout`.
    /// A response that arrives after the timeout is dropped on the floor.
    pub fn request(&mut self, command: &str, arguments: Value, timeout: Duration) -> Result<DapResponse> {
        let seq = self.send(command, arguments)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.pump(Some(seq), deadline, command)? {
                return process_response(response);
            }
        }
    }

    /// Send a request and return its seq immediately; the response is held in
    /// a deferred slot until [`DapClient::wait_for_response`] claims it.
    /// Needed for flows (debugpy `launch`/`attach`) where the adapter defers
    /// the response until after `configurationDone`.
    pub fn request_async(&mut self, command: &str, arguments: Value) -> Result<i64> {
        let seq = self.send(command, arguments)?;
        self.deferred.insert(seq, None);
        Ok(seq)
    }

    /// Suspend until the deferred slot for `seq` resolves or `timeout`.
    pub fn wait_for_response(&mut self, seq: i64, timeout: Duration) -> Result<DapResponse> {
        if !self.deferred.contains_key(&seq) {
            return Err(Error::UnknownSeq(seq));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(Some(response)) = self.deferred.get(&seq) {
                let response = response.clone();
                self.deferred.remove(&seq);
                return process_response(response);
            }
            match self.pump(None, deadline, "deferred response") {
                Ok(_) => {}
                Err(err) => {
                    // drop the slot so a late response is not delivered twice
                    self.deferred.remove(&seq);
                    return Err(err);
                }
            }
        }
    }

    /// Return a queued event named `name`, or block until one arrives.
    /// `None` on timeout; callers interpret absence, not failure.
    pub fn wait_for_event(&mut self, name: &str, timeout: Duration) -> Result<Option<DapEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self.events.iter().position(|ev| ev.event == name) {
                return Ok(self.events.remove(pos));
            }
            match self.pump(None, deadline, name) {
                Ok(_) => {}
                Err(Error::Timeout(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Remove and return all queued events named `name`, after one
    /// non-blocking pump pass. Used to poll terminal/exit/output events
    /// without suspending.
    pub fn drain_events(&mut self, name: &str) -> Result<Vec<DapEvent>> {
        loop {
            // generous deadline: it only applies once a frame has started,
            // an idle socket returns after a single read tick
            let deadline = Instant::now() + DEFAULT_REQUEST_TIMEOUT;
            match transport::try_read_message(&mut self.reader, deadline) {
                Ok(Some(raw)) => self.dispatch(Message::classify(raw)?, None),
                Ok(None) | Err(Error::Timeout(_)) => break,
                Err(Error::ConnectionClosed) => break,
                Err(err) => return Err(err),
            };
        }
        let mut matching = Vec::new();
        self.events.retain(|ev| {
            if ev.event == name {
                matching.push(ev.clone());
                false
            } else {
                true
            }
        });
        Ok(matching)
    }

    /// Read and dispatch inbound messages until a response for `pending`
    /// arrives (returned) or `deadline` passes (`Error::Timeout`).
    fn pump(
        &mut self,
        pending: Option<i64>,
        deadline: Instant,
        what: &str,
    ) -> Result<Option<DapResponse>> {
        loop {
            if Instant::now() > deadline {
                return Err(Error::Timeout(what.to_string()));
            }
            let raw = match transport::read_message(&mut self.reader, deadline) {
                Ok(raw) => raw,
                Err(Error::Timeout(_)) => return Err(Error::Timeout(what.to_string())),
                Err(err) => return Err(err),
            };
            match Message::classify(raw)? {
                Message::Response(response) if pending == Some(response.request_seq) => {
                    log::debug!(target: "dap", "<- {} {}", response.request_seq, response.command);
                    return Ok(Some(response));
                }
                message => {
                    self.dispatch(message, pending);
                    if pending.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, message: Message, pending: Option<i64>) {
        match message {
            Message::Event(event) => {
                log::debug!(target: "dap", "<- event {}", event.event);
                self.events.push_back(event);
            }
            Message::Response(response) => {
                debug_assert!(pending != Some(response.request_seq));
                match self.deferred.get_mut(&response.request_seq) {
                    Some(slot) => {
                        log::debug!(target: "dap", "<- deferred {} {}", response.request_seq, response.command);
                        *slot = Some(response);
                    }
                    // no live slot: the caller timed out or never existed
                    None => {
                        log::debug!(target: "dap", "dropping response for seq {}", response.request_seq);
                    }
                }
            }
            Message::Request(raw) => {
                log::debug!(target: "dap", "ignoring reverse request {:?}", raw.get("command"));
            }
        }
    }

    /// Send a best-effort `disconnect`, then close the socket. All deferred
    /// slots reject implicitly: the connection is gone.
    pub fn disconnect(&mut self, terminate_debuggee: bool) {
        let _ = self.send(
            "disconnect",
            serde_json::json!({ "terminateDebuggee": terminate_debuggee }),
        );
        // give the adapter a beat to act on it, ignore whatever comes back
        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while Instant::now() < deadline {
            match transport::try_read_message(&mut self.reader, deadline) {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.deferred.clear();
        self.events.clear();
        log::debug!(target: "dap", "disconnected");
    }
}

fn process_response(response: DapResponse) -> Result<DapResponse> {
    if response.success {
        Ok(response)
    } else {
        Err(Error::Adapter(response.error_message()))
    }
}

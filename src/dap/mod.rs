//! DAP client plumbing: message envelopes, `Content-Length` framing and a
//! correlated request/response/event client over TCP.

pub mod client;
pub mod transport;

pub use client::DapClient;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// DAP request envelope.
#[derive(Debug, Serialize)]
pub struct DapRequest {
    pub seq: i64,
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub command: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

/// DAP response envelope.
///
/// Note: the DAP specification allows responses with no `body` field at all,
/// keeping it a `serde_json::Value` keeps the envelope stable.
#[derive(Debug, Clone, Deserialize)]
pub struct DapResponse {
    pub seq: i64,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Value,
}

impl DapResponse {
    /// Best human-readable failure description the adapter gave us.
    pub fn error_message(&self) -> String {
        if let Some(format) = self
            .body
            .get("error")
            .and_then(|e| e.get("format"))
            .and_then(Value::as_str)
        {
            return format.to_string();
        }
        self.message
            .clone()
            .unwrap_or_else(|| format!("`{}` request failed", self.command))
    }
}

/// DAP event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DapEvent {
    pub seq: i64,
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

/// An inbound message classified by its `type` discriminator.
#[derive(Debug)]
pub enum Message {
    Response(DapResponse),
    Event(DapEvent),
    /// Reverse requests (`runInTerminal` and friends), ignored by this client.
    Request(Value),
}

impl Message {
    pub fn classify(raw: Value) -> crate::error::Result<Message> {
        match raw.get("type").and_then(Value::as_str) {
            Some("response") => Ok(Message::Response(serde_json::from_value(raw)?)),
            Some("event") => Ok(Message::Event(serde_json::from_value(raw)?)),
            Some("request") => Ok(Message::Request(raw)),
            other => Err(crate::error::Error::Frame(format!(
                "unknown message type {other:?}"
            ))),
        }
    }
}
